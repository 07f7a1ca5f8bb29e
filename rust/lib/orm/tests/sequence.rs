use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use openerp_orm::{SequenceCounter, SequenceGenerator};
use openerp_sql::{SQLStore, SqliteStore};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn generator(dir: &TempDir) -> SequenceGenerator {
    let store: Arc<dyn SQLStore> = Arc::new(SqliteStore::open(&dir.path().join("seq.sqlite")).unwrap());
    let sequences = SequenceGenerator::new(store);
    sequences.ensure_table().await.unwrap();
    sequences
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_next_never_repeats() {
    let dir = TempDir::new().unwrap();
    let sequences = generator(&dir).await;
    sequences
        .create(&SequenceCounter::new("sale.order", "Sales Order").with_prefix("SO"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let sequences = sequences.clone();
        handles.push(tokio::spawn(async move {
            sequences.next("sale.order", None).await
        }));
    }
    let mut codes = Vec::new();
    for handle in futures::future::join_all(handles).await {
        codes.push(handle.unwrap().unwrap());
    }

    let distinct: HashSet<&String> = codes.iter().collect();
    assert_eq!(distinct.len(), 50);
    let mut sorted = codes.clone();
    sorted.sort();
    assert_eq!(sorted.first().map(String::as_str), Some("SO0001"));
    assert_eq!(sorted.last().map(String::as_str), Some("SO0050"));
    assert_eq!(
        sequences.preview("sale.order", None).await.unwrap().as_deref(),
        Some("SO0051")
    );
}

#[tokio::test]
async fn yearly_prefix() {
    let dir = TempDir::new().unwrap();
    let sequences = generator(&dir).await;
    sequences
        .create(&SequenceCounter::new("yr", "Yearly").with_prefix("YR%(year)").dated())
        .await
        .unwrap();

    let day = NaiveDate::from_ymd_opt(2025, 11, 30);
    assert_eq!(sequences.next("yr", day).await.unwrap(), "YR20250001");
    assert_eq!(sequences.next("yr", day).await.unwrap(), "YR20250002");

    let next_year = NaiveDate::from_ymd_opt(2026, 1, 2);
    assert_eq!(sequences.preview("yr", next_year).await.unwrap().as_deref(), Some("YR20260003"));
}

#[tokio::test]
async fn preview_leaves_counter_untouched() {
    let dir = TempDir::new().unwrap();
    let sequences = generator(&dir).await;
    sequences
        .create(&SequenceCounter::new("inv", "Invoice").with_prefix("INV/").with_padding(5))
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(
            sequences.preview("inv", None).await.unwrap().as_deref(),
            Some("INV/00001")
        );
    }
    assert_eq!(sequences.get("inv").await.unwrap().unwrap().next_value, 1);
    assert_eq!(sequences.next("inv", None).await.unwrap(), "INV/00001");
    assert_eq!(sequences.get("inv").await.unwrap().unwrap().next_value, 2);
}
