use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use statreg_storage::{HttpClientConfig, HttpFetcher};
use statreg_sync::store::{Link, Table};
use statreg_sync::{connect_pool, pipeline_spec, CatalogStore, HarvestConfig, Harvester};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LISTING_PATH: &str = "/government/statistics.json";

fn row(id: i64, slug: &str, organisations: &str, day: u32) -> JsonValue {
    json!({
        "result": {
            "id": id,
            "title": format!("Publication {slug}"),
            "url": format!("/government/statistics/{slug}"),
            "organisations": organisations,
            "display_type": "Official Statistics",
            "public_timestamp": format!("2021-06-{day:02}T09:30:00.000+01:00"),
            "government_name": "2019 Conservative government"
        }
    })
}

async fn mock_gov_uk() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "head": {"vars": ["org", "label"]},
            "results": {"bindings": [
                {
                    "org": {"type": "uri", "value": "http://o/dfe"},
                    "label": {"type": "literal", "value": "Department for Education"}
                },
                {
                    "org": {"type": "uri", "value": "http://o/nhs-england"},
                    "label": {"type": "literal", "value": "NHS England"}
                }
            ]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LISTING_PATH))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [row(3, "c", "NHS England", 1)]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LISTING_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                row(1, "a", "<abbr title=\"Department for Education\">DfE</abbr>", 10),
                row(2, "b", "NHS England and Department for Education", 9)
            ],
            "next_page_url": format!("{LISTING_PATH}?page=2")
        })))
        .mount(&server)
        .await;
    server
}

fn config_for(server: &MockServer, cache_dir: &tempfile::TempDir) -> HarvestConfig {
    HarvestConfig {
        database_url: "sqlite::memory:".to_string(),
        cache_dir: cache_dir.path().to_path_buf(),
        user_agent: "statreg-tests".to_string(),
        http_timeout_secs: 5,
        sparql_endpoint: format!("{}/sparql", server.uri()),
        ons_api_url: format!("{}/dataset", server.uri()),
        whitehall_listing_url: format!("{}{LISTING_PATH}", server.uri()),
        scheduler_enabled: false,
        harvest_cron: "0 0 6 * * *".to_string(),
    }
}

#[tokio::test]
async fn whitehall_pipeline_harvests_mocked_listing_then_settles() {
    let server = mock_gov_uk().await;
    let cache_dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, &cache_dir);
    let pool = connect_pool(&config.database_url).await.unwrap();
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        cache_dir: Some(config.cache_dir.clone()),
        ..Default::default()
    })
    .unwrap();
    let harvester = Harvester::from_parts(config, pool.clone(), http);
    let spec = pipeline_spec("whitehall").unwrap();

    let first = harvester.run_pipeline(&spec).await.unwrap();
    assert_eq!(first.organisations, 2);
    assert_eq!(first.pages_fetched, 2);
    assert_eq!((first.created, first.updated, first.unchanged), (3, 0, 0));

    let store = CatalogStore::new(pool.clone(), spec.table_prefix).unwrap();
    let tables = store.tables();
    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(tables.count_rows(&mut conn, Table::Dataset).await.unwrap(), 3);
    assert_eq!(tables.count_rows(&mut conn, Table::Organisation).await.unwrap(), 2);

    let both = tables
        .find_dataset(&mut conn, &format!("{}/government/statistics/b", server.uri()))
        .await
        .unwrap()
        .expect("dataset b stored");
    let mut expected = BTreeSet::new();
    for uri in ["http://o/dfe", "http://o/nhs-england"] {
        let org = tables.find_organisation(&mut conn, uri).await.unwrap().unwrap();
        expected.insert(org.id);
    }
    let linked = tables
        .linked_ids(&mut conn, Link::DatasetOrganisation, both.id)
        .await
        .unwrap();
    assert_eq!(linked, expected);
    drop(conn);

    // Nothing changed upstream, so the first page is stale and paging stops there.
    let second = harvester.run_pipeline(&spec).await.unwrap();
    assert_eq!(second.pages_fetched, 1);
    assert_eq!((second.created, second.updated, second.unchanged), (0, 0, 2));
}
