use std::time::Duration;

use serde_json::json;
use statreg_adapters::{AdapterContext, OrganisationDirectory};
use statreg_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: None,
        cache_dir: None,
        backoff: BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        },
    })
    .expect("client builds")
}

#[tokio::test]
async fn directory_is_loaded_from_a_sparql_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparql"))
        .and(header("accept", "application/sparql-results+json"))
        .and(body_string_contains("query="))
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
        .expect(1)
        .mount(&server)
        .await;

    let ctx = AdapterContext {
        run_id: Uuid::new_v4(),
    };
    let endpoint = format!("{}/sparql", server.uri());
    let directory = OrganisationDirectory::fetch(&fetcher(), &ctx, &endpoint)
        .await
        .expect("directory loads");

    assert_eq!(directory.len(), 2);
    let matched = directory.match_display_text("NHS England and Department for Education");
    let uris = matched.iter().map(|e| e.uri.as_str()).collect::<Vec<_>>();
    assert_eq!(uris, vec!["http://o/dfe", "http://o/nhs-england"]);
}

#[tokio::test]
async fn unreachable_directory_surfaces_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparql"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let ctx = AdapterContext {
        run_id: Uuid::new_v4(),
    };
    let endpoint = format!("{}/sparql", server.uri());
    let result = OrganisationDirectory::fetch(&fetcher(), &ctx, &endpoint).await;
    assert!(result.is_err());
}
