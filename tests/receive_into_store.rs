mod common;

use std::sync::Arc;

use dimse::{
    DicomNode, DimseConfig, DimseScu, FoundStudy, PersistenceAdapter, StorageOptions,
    StorageSortKey, StoreScp,
};
use futures_util::StreamExt;
use pacsflow::RedbStore;
use tempfile::TempDir;

use common::write_ct;

fn loopback_config(ae_title: &str) -> DimseConfig {
    let mut config = DimseConfig::with_local(DicomNode::new(ae_title));
    config.bind_addr = "127.0.0.1".parse().unwrap();
    config
}

#[tokio::test]
async fn received_images_mark_found_studies_retrieved() {
    let dir = TempDir::new().unwrap();
    let outgoing = dir.path().join("outgoing");
    let archive = dir.path().join("archive");
    std::fs::create_dir(&outgoing).unwrap();
    write_ct(&outgoing.join("1.dcm"), "PAT7", "1.2.840.7", "1.2.840.7.1.1");
    write_ct(&outgoing.join("2.dcm"), "PAT7", "1.2.840.7", "1.2.840.7.1.2");

    let store = RedbStore::open(dir.path().join("pacsflow.redb")).unwrap();
    store.add_found_study(&FoundStudy::new("1.2.840.7")).unwrap();
    store.add_found_study(&FoundStudy::new("1.2.840.8")).unwrap();

    let mut scp = StoreScp::new(
        DicomNode::new("COLLECTOR").with_port(0),
        loopback_config("COLLECTOR"),
        StorageOptions::new(&archive)
            .with_sort_by(StorageSortKey::Study)
            .with_persistence(Arc::new(store.clone())),
    );
    let addr = tokio_test::assert_ok!(scp.start().await);

    let scu = DimseScu::new(loopback_config("SENDER"));
    let node = DicomNode::remote("COLLECTOR", "127.0.0.1", addr.port());
    let statuses: Vec<_> = scu.send_path(&node, &outgoing).await.unwrap().collect().await;
    scp.shutdown().await;

    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|(_, status)| status.is_success()));
    assert!(archive.join("1.2.840.7/1.2.840.7.1/1.2.840.7.1.2.dcm").is_file());

    assert_eq!(store.image_count().unwrap(), 2);
    assert_eq!(store.studies_pending_move().unwrap(), vec!["1.2.840.8"]);
    let image = store.image("1.2.840.7.1.1").unwrap().unwrap();
    assert_eq!(image.study_uid.as_deref(), Some("1.2.840.7"));
    assert!(image.filepath.unwrap().starts_with(&archive));
}
