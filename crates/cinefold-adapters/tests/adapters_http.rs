use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cinefold_adapters::{
    AdapterContext, ErrorKind, SourceAdapter, TmdbAdapter, TvmazeAdapter, WikidataAdapter,
};
use cinefold_core::{Cursor, ProviderKind, SourceId};
use cinefold_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, RecordingSleeper};
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(source: &str, name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source)
        .join("sample")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn http() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("cinefold-test/0.1".into()),
        global_concurrency: 4,
        min_request_interval: Duration::ZERO,
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: Duration::ZERO,
            max_elapsed: Duration::from_secs(1),
        },
    })
    .expect("fetcher")
    .with_sleeper(Arc::new(RecordingSleeper::default()))
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    }
}

fn json(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "application/json")
}

#[tokio::test]
async fn tmdb_page_is_enriched_and_degrades_per_title() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movie/popular"))
        .and(query_param("api_key", "test-key"))
        .and(query_param("page", "1"))
        .respond_with(json(fixture("tmdb", "movie_popular_page1.json")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie/603"))
        .and(query_param("append_to_response", "videos,credits,external_ids"))
        .respond_with(json(fixture("tmdb", "details_603.json")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie/603/watch/providers"))
        .respond_with(json(fixture("tmdb", "providers_603.json")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie/550"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie/550/watch/providers"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let adapter = TmdbAdapter::new("test-key", "test-token").with_base_url(server.uri());
    let page = adapter
        .list_page(&http(), &ctx(), "movie/popular", &Cursor::Start)
        .await
        .expect("page");

    assert!(page.has_more);
    assert_eq!(page.next_cursor, Cursor::Page(2));
    assert_eq!(page.dropped.len(), 1);
    assert_eq!(page.drafts.len(), 2);

    let matrix = &page.drafts[0];
    assert_eq!(matrix.source, SourceId::Tmdb);
    assert_eq!(matrix.imdb_id().map(|id| id.value.as_str()), Some("tt0133093"));
    assert_eq!(matrix.cast.len(), 3);
    assert_eq!(matrix.directors.len(), 2);
    assert_eq!(matrix.trailers.len(), 2);
    assert_eq!(matrix.budget, Some(63_000_000));
    assert_eq!(matrix.revenue, Some(463_517_383));
    assert!(matrix
        .providers
        .iter()
        .all(|p| p.region == "US"));
    assert!(matrix
        .providers
        .iter()
        .any(|p| p.provider_name == "Max" && p.kind == ProviderKind::Flatrate));

    let fight_club = &page.drafts[1];
    assert_eq!(fight_club.title, "Fight Club");
    assert!(fight_club.trailers.is_empty());
    assert!(fight_club.providers.is_empty());
    assert_eq!(fight_club.budget, None);
    assert!(fight_club.imdb_id().is_none());
    assert!(fight_club.genres.contains("Drama"));
}

#[tokio::test]
async fn tmdb_credential_rejection_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tv/airing_today"))
        .respond_with(ResponseTemplate::new(401).set_body_string(
            r#"{"status_code":7,"status_message":"Invalid API key: You must be granted a valid key."}"#,
        ))
        .mount(&server)
        .await;

    let adapter = TmdbAdapter::new("bad-key", "bad-token").with_base_url(server.uri());
    let err = adapter
        .list_page(&http(), &ctx(), "tv/airing_today", &Cursor::Page(3))
        .await
        .expect_err("401");

    assert_eq!(err.kind, ErrorKind::Fatal);
    assert_eq!(err.category, "tv/airing_today");
    assert!(!err.to_string().contains("bad-key"));
}

#[tokio::test]
async fn tmdb_last_page_reports_no_more() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trending/tv/week"))
        .and(query_param("page", "3"))
        .respond_with(json(r#"{"page":3,"results":[],"total_pages":3}"#.to_string()))
        .mount(&server)
        .await;

    let adapter = TmdbAdapter::new("k", "t").with_base_url(server.uri());
    let page = adapter
        .list_page(&http(), &ctx(), "tv/trending", &Cursor::Page(3))
        .await
        .expect("page");
    assert!(!page.has_more);
    assert!(page.drafts.is_empty());
}

#[tokio::test]
async fn tvmaze_pages_until_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("page", "0"))
        .respond_with(json(fixture("tvmaze", "shows_page0.json")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let adapter = TvmazeAdapter::new().with_base_url(server.uri());
    let http = http();

    let first = adapter
        .list_page(&http, &ctx(), "shows", &Cursor::Start)
        .await
        .expect("page 0");
    assert!(first.has_more);
    assert_eq!(first.next_cursor, Cursor::Page(1));
    assert_eq!(first.drafts.len(), 2);
    assert_eq!(
        first.drafts[1].poster_url.as_deref(),
        Some("https://static.tvmaze.com/uploads/images/medium_portrait/163/407679.jpg")
    );

    let end = adapter
        .list_page(&http, &ctx(), "shows", &first.next_cursor)
        .await
        .expect("404 is a clean end");
    assert!(!end.has_more);
    assert!(end.drafts.is_empty());
    assert_eq!(end.next_cursor, Cursor::Page(0));
}

#[tokio::test]
async fn wikidata_query_returns_grouped_films() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sparql"))
        .and(query_param("format", "json"))
        .respond_with(json(fixture("wikidata", "films.json")))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = WikidataAdapter::new(20).with_endpoint(format!("{}/sparql", server.uri()));
    let page = adapter
        .list_page(&http(), &ctx(), "films", &Cursor::Start)
        .await
        .expect("page");

    assert!(!page.has_more);
    assert_eq!(page.next_cursor, Cursor::Start);
    let titles: Vec<_> = page.drafts.iter().map(|d| d.title.as_str()).collect();
    assert_eq!(titles, vec!["The Matrix", "The Godfather"]);
    assert_eq!(page.drafts[0].year, Some(1999));
    assert_eq!(page.dropped.len(), 1);
}

#[tokio::test]
async fn malformed_envelope_is_a_data_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(json(r#"{"unexpected": true}"#.to_string()))
        .mount(&server)
        .await;

    let adapter = TvmazeAdapter::new().with_base_url(server.uri());
    let err = adapter
        .list_page(&http(), &ctx(), "shows", &Cursor::Page(4))
        .await
        .expect_err("object instead of array");
    assert_eq!(err.kind, ErrorKind::Data);
}
