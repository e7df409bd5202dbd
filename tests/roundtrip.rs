//! End-to-end archive/validate/delete/extract tests over an in-memory
//! object store shared by source, manifest and archive locations.

use std::sync::Arc;

use md5::{Digest, Md5};
use object_store::{memory::InMemory, path::Path, ObjectStore, ObjectStoreExt, PutPayload};
use similar_asserts::assert_eq;

use coldpack::{
    archive::{archive, ArchiveConfig},
    delete::{delete, DeleteConfig},
    extract::extract,
    manifest::ManifestReader,
    store::StoreHandle,
    validate::{validate, ValidateConfig},
    Error,
};

struct Fixture {
    store: Arc<dyn ObjectStore>,
    src: StoreHandle,
    manifest: StoreHandle,
    archive: StoreHandle,
}

fn fixture(manifest_name: &str) -> Fixture {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    Fixture {
        src: StoreHandle::new(store.clone(), "data", "testbucket"),
        manifest: StoreHandle::new(store.clone(), format!("meta/{manifest_name}"), "testbucket"),
        archive: StoreHandle::new(store.clone(), "cold/objects.tar", "testbucket"),
        store,
    }
}

fn bodies() -> Vec<(&'static str, Vec<u8>)> {
    // 10, 20 and 30 bytes: one header block plus one payload block each
    vec![
        ("data/a", b"aaaaaaaaaa".to_vec()),
        ("data/b", b"bbbbbbbbbbbbbbbbbbbb".to_vec()),
        ("data/c", (0u8..30).collect()),
    ]
}

async fn seed(fx: &Fixture) {
    for (key, body) in bodies() {
        fx.store
            .put(&Path::from(key), PutPayload::from(body))
            .await
            .unwrap();
    }
}

async fn archived_fixture() -> Fixture {
    let fx = fixture("manifest.csv");
    seed(&fx).await;
    archive(&fx.src, &fx.manifest, &fx.archive, &ArchiveConfig::default())
        .await
        .unwrap();
    fx
}

#[tokio::test]
async fn test_offsets_follow_block_math() {
    let fx = archived_fixture().await;

    let reader = ManifestReader::open(&fx.manifest).await.unwrap();
    let rows = reader.read_rows().unwrap();

    // one row per listed object, in listing order, keys unique
    let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["data/a", "data/b", "data/c"]);

    let offsets: Vec<_> = rows.iter().map(|r| r.tar_offset).collect();
    assert_eq!(offsets, vec![0, 1024, 2048]);
    for row in &rows {
        assert_eq!(row.tar_data_offset, row.tar_offset + 512);
        assert_eq!(row.bucket, "testbucket");
        assert_eq!(row.storage_class, "STANDARD");
    }
    assert_eq!(
        rows.iter().map(|r| r.tar_size).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );

    // last entry padded to a block, plus the two-block terminator
    let last = rows.last().unwrap();
    let padded_end = (last.tar_data_offset + last.tar_size).div_ceil(512) * 512;
    assert_eq!(fx.archive.len().await.unwrap(), padded_end + 1024);
    assert_eq!(fx.archive.len().await.unwrap(), 4096);
}

#[tokio::test]
async fn test_range_reads_reproduce_originals() {
    let fx = archived_fixture().await;
    let rows = ManifestReader::open(&fx.manifest)
        .await
        .unwrap()
        .read_rows()
        .unwrap();

    for (row, (key, body)) in rows.iter().zip(bodies()) {
        assert_eq!(row.key, key);
        let ranged = fx
            .archive
            .read_range(row.tar_data_offset, row.tar_size)
            .await
            .unwrap();
        assert_eq!(ranged.as_ref(), body.as_slice());
        assert_eq!(hex::encode(Md5::digest(&ranged)), row.tar_md5);
    }
}

#[tokio::test]
async fn test_archive_is_a_readable_tar_stream() {
    let fx = archived_fixture().await;
    let bytes = fx.archive.read_all().await.unwrap();

    let mut tar = tar::Archive::new(bytes.as_ref());
    let mut seen = Vec::new();
    for entry in tar.entries().unwrap() {
        let mut entry = entry.unwrap();
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
        seen.push((entry.path().unwrap().display().to_string(), content));
    }
    let expected: Vec<_> = bodies()
        .into_iter()
        .map(|(k, b)| (k.to_string(), b))
        .collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_validate_clean_then_detect_single_corruption() {
    let fx = archived_fixture().await;

    let summary = validate(&fx.manifest, &fx.archive, Some(&fx.src), &ValidateConfig::default())
        .await
        .unwrap();
    assert_eq!(summary.rows, 3);

    // flip one byte inside the second entry's payload
    let rows = ManifestReader::open(&fx.manifest)
        .await
        .unwrap()
        .read_rows()
        .unwrap();
    let mut bytes = fx.archive.read_all().await.unwrap().to_vec();
    let victim = &rows[1];
    bytes[(victim.tar_data_offset + 3) as usize] ^= 0xff;
    fx.store
        .put(fx.archive.path(), PutPayload::from(bytes))
        .await
        .unwrap();

    match validate(&fx.manifest, &fx.archive, None, &ValidateConfig::default()).await {
        Err(Error::Validation(report)) => {
            assert_eq!(report.rows, 3);
            assert_eq!(report.mismatches.len(), 1);
            assert_eq!(report.mismatches[0].key, "data/b");
            assert!(report.mismatches[0].detail.contains("checksum mismatch"));
        }
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_validate_reports_source_drift() {
    let fx = archived_fixture().await;

    // grow one source object and add an unarchived one
    fx.store
        .put(&Path::from("data/b"), PutPayload::from_static(b"now much longer than before"))
        .await
        .unwrap();
    fx.store
        .put(&Path::from("data/d"), PutPayload::from_static(b"new"))
        .await
        .unwrap();

    match validate(&fx.manifest, &fx.archive, Some(&fx.src), &ValidateConfig::default()).await {
        Err(Error::Validation(report)) => {
            let keys: Vec<_> = report.mismatches.iter().map(|m| m.key.as_str()).collect();
            assert!(keys.contains(&"data/b"));
            assert!(keys.contains(&"data/d"));
        }
        other => panic!("expected drift to fail validation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_dry_run_then_confirm_then_repeat() {
    let fx = archived_fixture().await;
    fx.store
        .put(&Path::from("other/keep"), PutPayload::from_static(b"keep me"))
        .await
        .unwrap();
    let rows = ManifestReader::open(&fx.manifest)
        .await
        .unwrap()
        .read_rows()
        .unwrap();

    // dry run deletes nothing and counts every manifest row
    let report = delete(&fx.src, &rows, &DeleteConfig::default()).await.unwrap();
    assert_eq!(report.requested, 3);
    assert_eq!(report.deleted, 0);
    assert!(fx.store.head(&Path::from("data/a")).await.is_ok());

    // confirmed delete removes exactly the listed keys
    let confirm = DeleteConfig {
        confirm: true,
        ..DeleteConfig::default()
    };
    let report = delete(&fx.src, &rows, &confirm).await.unwrap();
    assert_eq!(report.deleted, 3);
    assert!(report.failed.is_empty());
    for (key, _) in bodies() {
        assert!(fx.store.head(&Path::from(key)).await.is_err());
    }
    assert!(fx.store.head(&Path::from("other/keep")).await.is_ok());

    // repeating is a no-op success
    let report = delete(&fx.src, &rows, &confirm).await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.already_absent, 3);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_extract_present_and_absent_keys() {
    let fx = archived_fixture().await;
    let index = ManifestReader::open(&fx.manifest)
        .await
        .unwrap()
        .index()
        .unwrap();

    let mut out = Vec::new();
    let written = extract(&index, &fx.archive, "data/c", &mut out).await.unwrap();
    assert_eq!(written, 30);
    assert_eq!(out, (0u8..30).collect::<Vec<u8>>());

    let mut out = Vec::new();
    match extract(&index, &fx.archive, "data/zzz", &mut out).await {
        Err(Error::NotFound(key)) => assert_eq!(key, "data/zzz"),
        other => panic!("expected a lookup miss, got {other:?}"),
    }
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_empty_source_writes_nothing() {
    let fx = fixture("manifest.csv");

    match archive(&fx.src, &fx.manifest, &fx.archive, &ArchiveConfig::default()).await {
        Err(Error::EmptySource(prefix)) => assert!(prefix.contains("data")),
        other => panic!("expected an empty-source failure, got {other:?}"),
    }
    assert!(!fx.manifest.exists().await.unwrap());
    assert!(!fx.archive.exists().await.unwrap());
}

#[tokio::test]
async fn test_failed_run_leaves_no_outputs() {
    let fx = fixture("manifest.csv");
    seed(&fx).await;

    // a key too long for a plain ustar header fails the run mid-stream
    let long_key = format!("data/{}leaf", "k/".repeat(150));
    fx.store
        .put(&Path::from(long_key.as_str()), PutPayload::from_static(b"zz"))
        .await
        .unwrap();

    match archive(&fx.src, &fx.manifest, &fx.archive, &ArchiveConfig::default()).await {
        Err(Error::InvalidKey { .. }) => {}
        other => panic!("expected an invalid-key failure, got {other:?}"),
    }
    assert!(!fx.manifest.exists().await.unwrap());
    assert!(!fx.archive.exists().await.unwrap());
}

#[tokio::test]
async fn test_refuses_to_overwrite_outputs() {
    let fx = archived_fixture().await;

    match archive(&fx.src, &fx.manifest, &fx.archive, &ArchiveConfig::default()).await {
        Err(Error::WouldOverwrite(url)) => assert!(url.contains("manifest.csv")),
        other => panic!("expected an overwrite refusal, got {other:?}"),
    }

    let overwrite = ArchiveConfig {
        overwrite: true,
        ..ArchiveConfig::default()
    };
    let summary = archive(&fx.src, &fx.manifest, &fx.archive, &overwrite)
        .await
        .unwrap();
    assert_eq!(summary.objects, 3);
}

#[tokio::test]
async fn test_gzip_manifest_roundtrip() {
    let fx = fixture("manifest.csv.gz");
    seed(&fx).await;
    archive(&fx.src, &fx.manifest, &fx.archive, &ArchiveConfig::default())
        .await
        .unwrap();

    // stored bytes are gzip, not plain csv
    let raw = fx.manifest.read_all().await.unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let rows = ManifestReader::open(&fx.manifest)
        .await
        .unwrap()
        .read_rows()
        .unwrap();
    assert_eq!(rows.len(), 3);

    validate(&fx.manifest, &fx.archive, None, &ValidateConfig::default())
        .await
        .unwrap();
}
