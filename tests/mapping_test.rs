//! Tests for typed views over memory-mapped files.

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use core_resources::error::{CoreError, ErrorCategory};
use core_resources::mapping::{MappedView, MappingRules};
use core_resources::resource::{RegistryConfig, ResourceRegistry};
use core_resources::telemetry::CollectingSink;

fn registry() -> ResourceRegistry {
    ResourceRegistry::start(
        RegistryConfig {
            tick_interval: Duration::from_secs(3600),
            ..RegistryConfig::default()
        },
        CollectingSink::new(),
    )
    .unwrap()
}

fn file_with(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

fn u32_file(values: &[u32]) -> NamedTempFile {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    file_with(&bytes)
}

#[tokio::test]
async fn test_reads_elements_in_bounds() {
    let registry = registry();
    let file = u32_file(&[10, 20, 30, 40]);
    let view: MappedView<u32> = MappedView::open(&registry, file.path(), &MappingRules::default()).unwrap();

    assert_eq!(view.len(), 4);
    assert_eq!(view.byte_len(), 16);
    assert_eq!(*view.get(2).unwrap(), 30);
    assert_eq!(view.iter().copied().sum::<u32>(), 100);
    assert_eq!(view.path(), Some(file.path()));
}

#[tokio::test]
async fn test_out_of_bounds_is_an_error() {
    let registry = registry();
    let file = u32_file(&[1, 2, 3]);
    let view: MappedView<u32> = MappedView::open(&registry, file.path(), &MappingRules::default()).unwrap();

    let err = view.get(3).unwrap_err();
    assert!(matches!(err, CoreError::OutOfBounds { index: 3, len: 3 }));
    assert_eq!(err.category(), ErrorCategory::InvalidLayout);
    assert!(view.slice(1..5).is_err());
}

#[tokio::test]
async fn test_slice_shares_mapping() {
    let registry = registry();
    let file = u32_file(&[0, 1, 2, 3, 4, 5]);
    let view: MappedView<u32> = MappedView::open(&registry, file.path(), &MappingRules::default()).unwrap();

    let middle = view.slice(2..5).unwrap();
    assert_eq!(middle.as_slice(), &[2, 3, 4]);
    assert_eq!(middle.resource_id(), view.resource_id());
    assert_eq!(view.holders(), 2);

    let tail = middle.slice(1..).unwrap();
    assert_eq!(tail.as_slice(), &[3, 4]);
    assert_eq!(*tail.get(0).unwrap(), 3);
}

#[tokio::test]
async fn test_size_not_a_multiple_is_rejected() {
    let registry = registry();
    let file = file_with(&[0u8; 10]);
    let result = MappedView::<u32>::open(&registry, file.path(), &MappingRules::default());
    assert!(matches!(result, Err(CoreError::InvalidLayout(_))));
    assert!(registry.outstanding().is_empty());
}

#[tokio::test]
async fn test_header_offset_is_skipped() {
    let registry = registry();
    let mut bytes = vec![0xAAu8; 8];
    for v in [7u64, 8, 9] {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    let file = file_with(&bytes);
    let rules = MappingRules {
        offset: 8,
        ..MappingRules::default()
    };
    let view: MappedView<u64> = MappedView::open(&registry, file.path(), &rules).unwrap();
    assert_eq!(view.as_slice(), &[7, 8, 9]);
}

#[tokio::test]
async fn test_misaligned_offset_is_rejected() {
    let registry = registry();
    let file = file_with(&[0u8; 20]);
    let rules = MappingRules {
        offset: 4,
        ..MappingRules::default()
    };
    let result = MappedView::<u64>::open(&registry, file.path(), &rules);
    assert!(matches!(result, Err(CoreError::InvalidLayout(_))));
}

#[tokio::test]
async fn test_element_limit_and_empty_files() {
    let registry = registry();
    let file = u32_file(&[1, 2, 3, 4]);
    let rules = MappingRules {
        max_elements: Some(3),
        ..MappingRules::default()
    };
    assert!(matches!(
        MappedView::<u32>::open(&registry, file.path(), &rules),
        Err(CoreError::InvalidLayout(_))
    ));

    let empty = file_with(&[]);
    assert!(MappedView::<u32>::open(&registry, empty.path(), &MappingRules::default()).is_err());
    let allowed = MappingRules {
        allow_empty: true,
        ..MappingRules::default()
    };
    let view = MappedView::<u32>::open(&registry, empty.path(), &allowed).unwrap();
    assert!(view.is_empty());
    assert!(view.as_slice().is_empty());
}

#[tokio::test]
async fn test_missing_file_is_io_error() {
    let registry = registry();
    let dir = tempfile::tempdir().unwrap();
    let result = MappedView::<u8>::open(&registry, dir.path().join("absent.bin"), &MappingRules::default());
    assert!(matches!(result, Err(CoreError::Io(_))));
}

#[tokio::test]
async fn test_mapping_released_after_last_view() {
    let registry = registry();
    let file = u32_file(&[5; 8]);
    let view: MappedView<u32> = MappedView::open(&registry, file.path(), &MappingRules::default()).unwrap();
    let id = view.resource_id();
    let copy = view.clone();
    let part = view.slice(..4).unwrap();
    assert!(registry.info(id).is_some());

    drop(view);
    drop(copy);
    assert_eq!(registry.pending(), 0);
    assert_eq!(part.as_slice(), &[5, 5, 5, 5]);

    drop(part);
    assert_eq!(registry.pending(), 1);
    let report = registry.run_pending().await;
    assert_eq!(report.completed, vec![id]);
    assert!(registry.info(id).is_none());
}
