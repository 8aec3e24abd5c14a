//! Query API tests against a locally served router

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::StatusCode;
    use reqwest::header;
    use serde_json::{Map, Value, json};
    use tokio::net::TcpListener;

    use events_indexer::storage::{EventStore, SharedStore, SqliteStore};
    use events_indexer::types::EventRecord;
    use events_indexer::web_api::create_web_api;

    const TX_A: &str = "0x00000000000000000000000000000000000000000000000000000000000000aa";
    const TX_B: &str = "0x00000000000000000000000000000000000000000000000000000000000000bb";

    fn record(contract: &str, event: &str, block_number: u64, tx: &str, log_index: u64, data: Value) -> EventRecord {
        let event_data: Map<String, Value> = data.as_object().cloned().unwrap_or_default();
        EventRecord {
            contract_name: contract.to_string(),
            contract_address: "0x1e3d7fd130aaadf17dfafa50370044813854bf53".to_string(),
            event_name: event.to_string(),
            block_number,
            block_hash: format!("0x{:064x}", block_number),
            transaction_hash: tx.to_string(),
            transaction_index: 0,
            log_index,
            event_data,
            indexed_at: 1_700_000_000_000,
        }
    }

    fn seeded_store() -> SharedStore {
        let store = SqliteStore::in_memory().unwrap();
        store
            .save_event(&record("nft", "Transfer", 10, TX_A, 0, json!({"tokenId": "18446744073709551617"})))
            .unwrap();
        store.save_event(&record("nft", "Transfer", 10, TX_A, 1, json!({"tokenId": "2"}))).unwrap();
        store.save_event(&record("nft", "Transfer", 11, TX_B, 0, json!({"tokenId": "3"}))).unwrap();
        store
            .save_event(&record("gasless", "MessagePosted", 9, TX_B, 1, json!({"user": "0xabc", "message": "gm"})))
            .unwrap();
        store.save_last_block(11).unwrap();
        Arc::new(store)
    }

    /// Serve the API on an ephemeral port and return its base URL.
    async fn spawn_api(store: SharedStore) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, create_web_api(store)).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn get(base: &str, path: &str) -> (StatusCode, Value) {
        let response = reqwest::get(format!("{}{}", base, path)).await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_events_envelope_and_ordering() {
        let app = spawn_api(seeded_store()).await;
        let (status, body) = get(&app, "/events").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["count"], json!(4));
        let positions: Vec<(u64, u64)> = body["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| (e["block_number"].as_u64().unwrap(), e["log_index"].as_u64().unwrap()))
            .collect();
        assert_eq!(positions, vec![(11, 0), (10, 1), (10, 0), (9, 1)]);
    }

    #[tokio::test]
    async fn test_big_integer_is_returned_as_exact_string() {
        let app = spawn_api(seeded_store()).await;
        let (_, body) = get(&app, "/events?contract=nft&fromBlock=10&toBlock=10&limit=1&offset=1").await;

        assert_eq!(body["count"], json!(1));
        assert_eq!(body["events"][0]["event_data"]["tokenId"], json!("18446744073709551617"));
    }

    #[tokio::test]
    async fn test_event_filters() {
        let app = spawn_api(seeded_store()).await;

        let (_, body) = get(&app, "/events?event=MessagePosted").await;
        assert_eq!(body["count"], json!(1));
        assert_eq!(body["events"][0]["contract_name"], json!("gasless"));

        let (_, body) = get(&app, "/events?contract=&limit=").await;
        assert_eq!(body["count"], json!(4), "empty parameters are ignored");
    }

    #[tokio::test]
    async fn test_invalid_query_parameter_is_bad_request() {
        let app = spawn_api(seeded_store()).await;
        let (status, body) = get(&app, "/events?fromBlock=ten").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("fromBlock"));

        let (status, _) = get(&app, "/events/contract/nft?limit=-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_query_integers_beyond_storage_range_are_bad_request() {
        let app = spawn_api(seeded_store()).await;

        for path in [
            "/events?limit=9223372036854775808",
            "/events?fromBlock=18446744073709551615",
            "/events/contract/nft?offset=9223372036854775808",
        ] {
            let (status, body) = get(&app, path).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
            assert!(body["error"].as_str().unwrap().contains("out of range"), "{path}");
        }

        let (status, body) = get(&app, "/events?toBlock=9223372036854775807").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], json!(4));
    }

    #[tokio::test]
    async fn test_transaction_events_normalise_hash() {
        let app = spawn_api(seeded_store()).await;
        let (status, body) = get(&app, &format!("/events/tx/{}", TX_B.to_uppercase().replace("0X", "0x"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transactionHash"], json!(TX_B));
        assert_eq!(body["count"], json!(2));
        assert_eq!(body["events"][0]["log_index"], json!(0));
        assert_eq!(body["events"][1]["log_index"], json!(1));
    }

    #[tokio::test]
    async fn test_contract_events_paginated() {
        let app = spawn_api(seeded_store()).await;
        let (_, body) = get(&app, "/events/contract/nft?limit=2").await;

        assert_eq!(body["contract"], json!("nft"));
        assert_eq!(body["count"], json!(2));
        assert_eq!(body["events"][0]["block_number"], json!(11));

        let (_, body) = get(&app, "/events/contract/unknown").await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["count"], json!(0));
    }

    #[tokio::test]
    async fn test_stats() {
        let app = spawn_api(seeded_store()).await;
        let (status, body) = get(&app, "/stats").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["stats"],
            json!({
                "totalEvents": 4,
                "eventsByContract": [{"name": "gasless", "count": 1}, {"name": "nft", "count": 3}],
                "eventsByType": [{"name": "MessagePosted", "count": 1}, {"name": "Transfer", "count": 3}],
                "lastProcessedBlock": 11
            })
        );
    }

    #[tokio::test]
    async fn test_health_and_unknown_route() {
        let app = spawn_api(seeded_store()).await;

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("healthy"));
        assert!(chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());

        let (status, body) = get(&app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"success": false, "error": "Not found"}));
    }

    #[tokio::test]
    async fn test_cors_is_open() {
        let app = spawn_api(seeded_store()).await;
        let response = reqwest::Client::new()
            .get(format!("{}/health", app))
            .header(header::ORIGIN, "http://localhost:3000")
            .send()
            .await
            .unwrap();

        assert_eq!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }
}
