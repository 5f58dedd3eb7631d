#![allow(dead_code)]

use envflow_cloud::{MemoryStore, RecordStore};
use envflow_controlplane::testing::{FakeCloud, RecordingProvisioner};
use envflow_controlplane::{ControlPlane, ProgressEvent, Settings};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Harness {
    pub plane: ControlPlane,
    pub cloud: Arc<FakeCloud>,
    pub store: Arc<MemoryStore>,
    pub provisioner: Arc<RecordingProvisioner>,
    pub state_dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(FakeCloud::new(), RecordingProvisioner::new())
}

pub fn harness_with(cloud: FakeCloud, provisioner: RecordingProvisioner) -> Harness {
    let state_dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        region: "eu-west-1".to_string(),
        state_dir: state_dir.path().to_path_buf(),
        ..Settings::default()
    };

    let cloud = Arc::new(cloud);
    let store = Arc::new(MemoryStore::new());
    let provisioner = Arc::new(provisioner);
    let plane = ControlPlane::new(
        settings,
        cloud.clone(),
        store.clone() as Arc<dyn RecordStore>,
        provisioner.clone(),
    )
    .unwrap();

    Harness {
        plane,
        cloud,
        store,
        provisioner,
        state_dir,
    }
}

pub fn messages(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

pub fn assert_done(events: &[ProgressEvent]) {
    match events.last() {
        Some(ProgressEvent::Done) => {}
        other => panic!("expected Done, got {:?}", other),
    }
}
