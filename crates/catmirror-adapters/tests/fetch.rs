use std::path::Path;
use std::sync::Arc;

use catmirror_adapters::{
    FetchOptions, FixtureTransport, JsonCatalogSource, JsonLayout, PaginatedFetcher,
    PaginationStyle, SocrataCatalogSource, StopReason,
};
use catmirror_core::PageCursor;
use catmirror_storage::{
    HttpClientConfig, RegionConfig, RegionalClient, RegionalRouter, ResilienceClient,
    ShutdownSignal, VirtualClock,
};
use chrono::{TimeZone, Utc};

const HOST: &str = "data.city.gov";

fn write_page(root: &Path, file: &str, body: &str) {
    let dir = root.join(HOST);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), body).unwrap();
}

fn client(root: &Path) -> RegionalClient {
    let clock = Arc::new(VirtualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
    ));
    let resilience = ResilienceClient::new(
        Arc::new(FixtureTransport::new(root)),
        clock,
        &HttpClientConfig::default(),
    );
    // Generic JSON catalogs live on the portal itself; fixtures key on that host.
    let mut regions = RegionConfig::default();
    regions.endpoints.insert("us".into(), "https://{host}".into());
    RegionalClient::new(
        Arc::new(resilience),
        Arc::new(RegionalRouter::new(regions).unwrap()),
    )
}

#[tokio::test]
async fn offset_pages_stop_on_a_short_page() {
    let dir = tempfile::tempdir().unwrap();
    write_page(
        dir.path(),
        "offset-0.json",
        r#"{"results": [
            {"resource": {"id": "a", "updatedAt": "2025-01-01"}},
            {"resource": {"id": "a", "updatedAt": "2025-02-01"}}
        ], "resultSetSize": 3}"#,
    );
    write_page(
        dir.path(),
        "offset-2.json",
        r#"{"results": [{"resource": {"id": "b", "updatedAt": null}}]}"#,
    );

    let client = client(dir.path());
    let source = SocrataCatalogSource::new(HOST, PaginationStyle::Offset);
    let options = FetchOptions {
        page_size: 2,
        ..FetchOptions::default()
    };
    let mut fetcher = PaginatedFetcher::new(&client, &source, options, None).unwrap();
    let shutdown = ShutdownSignal::never();

    let first = fetcher.next_page(&shutdown).await.unwrap().unwrap();
    assert_eq!(first.records.len(), 2, "in-page repeats are left to the normalizer");
    assert_eq!(first.next_cursor, PageCursor::Offset { offset: 2 });
    assert_eq!(first.region, "us");
    assert_eq!(fetcher.expected_total(), Some(3));

    let second = fetcher.next_page(&shutdown).await.unwrap().unwrap();
    assert_eq!(second.records[0].identifier(), Some("b"));
    assert_eq!(fetcher.stop_reason(), Some(StopReason::ShortPage));
    assert!(StopReason::ShortPage.covers_catalog());
    assert!(fetcher.next_page(&shutdown).await.unwrap().is_none());
    assert_eq!(fetcher.cursor(), &PageCursor::Offset { offset: 4 });
}

#[tokio::test]
async fn repeated_ids_pass_through_until_a_repeating_source_is_cut_off() {
    let dir = tempfile::tempdir().unwrap();
    let page = r#"[{"id": "x"}, {"id": "y"}]"#;
    for offset in [0, 2, 4, 6, 8] {
        write_page(dir.path(), &format!("offset-{offset}.json"), page);
    }

    let client = client(dir.path());
    let source = JsonCatalogSource::new(HOST, PaginationStyle::Offset, JsonLayout::default());
    let options = FetchOptions {
        page_size: 2,
        ..FetchOptions::default()
    };
    let mut fetcher = PaginatedFetcher::new(&client, &source, options, None).unwrap();
    let shutdown = ShutdownSignal::never();
    let mut repeated = Vec::new();
    let mut ids = Vec::new();
    while let Some(page) = fetcher.next_page(&shutdown).await.unwrap() {
        repeated.push(page.repeated);
        ids.extend(page.records.iter().filter_map(|r| r.identifier().map(str::to_string)));
    }

    // Repeats are left for freshness to decide downstream.
    assert_eq!(ids, vec!["x", "y", "x", "y", "x", "y"]);
    assert_eq!(repeated, vec![0, 2, 2]);
    // Two all-repeat pages exceed one page's worth of repeats.
    assert_eq!(fetcher.stop_reason(), Some(StopReason::DuplicateStreak));
    assert!(!StopReason::DuplicateStreak.covers_catalog());
    assert_eq!(fetcher.cursor(), &PageCursor::Offset { offset: 6 });
}

#[tokio::test]
async fn offset_ceiling_bounds_a_source_that_never_ends() {
    let dir = tempfile::tempdir().unwrap();
    for offset in 0..=5u64 {
        write_page(
            dir.path(),
            &format!("offset-{offset}.json"),
            &format!(r#"[{{"id": "r{offset}"}}]"#),
        );
    }

    let client = client(dir.path());
    let source = JsonCatalogSource::new(HOST, PaginationStyle::Offset, JsonLayout::default());
    let options = FetchOptions {
        page_size: 1,
        max_offset: 3,
    };
    let mut fetcher = PaginatedFetcher::new(&client, &source, options, None).unwrap();
    let shutdown = ShutdownSignal::never();
    let mut pages = 0;
    while fetcher.next_page(&shutdown).await.unwrap().is_some() {
        pages += 1;
    }
    assert_eq!(pages, 4);
    assert_eq!(fetcher.stop_reason(), Some(StopReason::OffsetCeiling));
    assert!(!StopReason::OffsetCeiling.covers_catalog());
}

#[tokio::test]
async fn continuation_follows_tokens_and_resumes_mid_stream() {
    let dir = tempfile::tempdir().unwrap();
    write_page(
        dir.path(),
        "start.json",
        r#"{"results": [{"id": "a"}], "next_page_token": "p2"}"#,
    );
    write_page(
        dir.path(),
        "token-p2.json",
        r#"{"results": [{"id": "b"}], "next_page_token": "p3"}"#,
    );
    write_page(dir.path(), "token-p3.json", r#"{"results": [{"id": "c"}]}"#);

    let client = client(dir.path());
    let source = JsonCatalogSource::new(HOST, PaginationStyle::Continuation, JsonLayout::default());

    let full = PaginatedFetcher::new(&client, &source, FetchOptions::default(), None).unwrap();
    let (records, cursor) = full.fetch_all(&ShutdownSignal::never()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(cursor, PageCursor::Continuation { token: None });

    let resume = PageCursor::Continuation {
        token: Some("p3".into()),
    };
    let resumed =
        PaginatedFetcher::new(&client, &source, FetchOptions::default(), Some(resume)).unwrap();
    let (records, _) = resumed.fetch_all(&ShutdownSignal::never()).await.unwrap();
    let ids: Vec<_> = records.iter().filter_map(|r| r.identifier()).collect();
    assert_eq!(ids, vec!["c"]);
}

#[test]
fn a_cursor_of_the_wrong_kind_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());
    let source = SocrataCatalogSource::new(HOST, PaginationStyle::Continuation);
    let result = PaginatedFetcher::new(
        &client,
        &source,
        FetchOptions::default(),
        Some(PageCursor::Offset { offset: 10 }),
    );
    assert!(matches!(
        result,
        Err(catmirror_adapters::FetchError::Config(
            catmirror_core::ConfigError::MalformedResumeToken { .. }
        ))
    ));
}
