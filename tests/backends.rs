use futures::StreamExt;
use papermind::embeddings::Embedder;
use papermind::error::RagError;
use papermind::gemini::{GeminiClient, GeminiConfig};
use papermind::generation::Generator;
use papermind::ollama::{OllamaClient, OllamaConfig};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ollama(server: &MockServer, timeout: Duration) -> OllamaClient {
    let config = OllamaConfig {
        url: server.uri(),
        embedding_model: "all-minilm".to_string(),
        generation_model: "tinyllama".to_string(),
    };
    OllamaClient::new(config, timeout).unwrap()
}

fn gemini(server: &MockServer) -> GeminiClient {
    let config = GeminiConfig {
        api_key: "test-key".to_string(),
        base_url: format!("{}/v1beta", server.uri()),
        embedding_model: "text-embedding-004".to_string(),
        generation_model: "gemini-1.5-flash".to_string(),
    };
    GeminiClient::new(config, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_ollama_embedding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .and(body_partial_json(json!({ "model": "all-minilm", "prompt": "hello" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embedding": [0.5, -0.25, 1.0] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ollama(&server, Duration::from_secs(5));
    let embedding = client.embed("hello").await.unwrap();

    assert_eq!(embedding.values, vec![0.5, -0.25, 1.0]);
    assert_eq!(Embedder::model(&client), "all-minilm");
}

#[tokio::test]
async fn test_ollama_error_carries_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "error": "model 'all-minilm' not found" })),
        )
        .mount(&server)
        .await;

    let err = ollama(&server, Duration::from_secs(5))
        .embed("hello")
        .await
        .unwrap_err();

    match err {
        RagError::Embedding(message) => assert!(message.contains("not found"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_ollama_empty_embedding_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embedding": [] })))
        .mount(&server)
        .await;

    let err = ollama(&server, Duration::from_secs(5))
        .embed("hello")
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Embedding(_)));
}

#[tokio::test]
async fn test_ollama_generation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "tinyllama",
            "prompt": "### Question:\nWhere?",
            "stream": false,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "tinyllama",
            "response": "In Paris.",
            "done": true,
        })))
        .mount(&server)
        .await;

    let answer = ollama(&server, Duration::from_secs(5))
        .generate("### Question:\nWhere?")
        .await
        .unwrap();
    assert_eq!(answer, "In Paris.");
}

#[tokio::test]
async fn test_ollama_streamed_generation() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"model\":\"tinyllama\",\"response\":\"In\",\"done\":false}\n",
        "{\"model\":\"tinyllama\",\"response\":\" Paris.\",\"done\":false}\n",
        "{\"model\":\"tinyllama\",\"response\":\"\",\"done\":true}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "model": "tinyllama", "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .expect(1)
        .mount(&server)
        .await;

    let pieces: Vec<String> = ollama(&server, Duration::from_secs(5))
        .generate_stream("### Question:\nWhere?")
        .await
        .unwrap()
        .map(|piece| piece.unwrap())
        .collect()
        .await;
    assert_eq!(pieces, vec!["In".to_string(), " Paris.".to_string()]);
}

#[tokio::test]
async fn test_ollama_stream_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "out of memory" })))
        .mount(&server)
        .await;

    let err = ollama(&server, Duration::from_secs(5))
        .generate_stream("prompt")
        .await
        .err()
        .unwrap();
    assert!(matches!(&err, RagError::Generation(msg) if msg.contains("out of memory")));
}

#[tokio::test]
async fn test_ollama_timeouts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "embedding": [1.0], "response": "late" }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = ollama(&server, Duration::from_millis(50));

    let err = client.embed("hello").await.unwrap_err();
    assert!(matches!(err, RagError::Timeout(_)), "got {:?}", err);

    let err = client.generate("prompt").await.unwrap_err();
    assert!(matches!(err, RagError::Generation(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_gemini_embedding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/text-embedding-004:embedContent"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(json!({
            "model": "models/text-embedding-004",
            "content": { "parts": [{ "text": "hello" }] },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embedding": { "values": [0.1, 0.2, 0.3] }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embedding = gemini(&server).embed("hello").await.unwrap();
    assert_eq!(embedding.dimension(), 3);
}

#[tokio::test]
async fn test_gemini_generation_joins_parts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(json!({
            "contents": [{ "role": "user", "parts": [{ "text": "Where?" }] }],
            "generationConfig": { "maxOutputTokens": 1024 },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Paris" }, { "text": " is the capital." }] }
            }]
        })))
        .mount(&server)
        .await;

    let answer = gemini(&server).generate("Where?").await.unwrap();
    assert_eq!(answer, "Paris is the capital.");

    // No streaming endpoint is used; the whole answer arrives as one piece
    let pieces: Vec<String> = gemini(&server)
        .generate_stream("Where?")
        .await
        .unwrap()
        .map(|piece| piece.unwrap())
        .collect()
        .await;
    assert_eq!(pieces, vec!["Paris is the capital.".to_string()]);
}

#[tokio::test]
async fn test_gemini_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/text-embedding-004:embedContent"))
        .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
        .mount(&server)
        .await;

    let client = gemini(&server);

    let err = client.generate("Where?").await.unwrap_err();
    assert!(matches!(err, RagError::Generation(_)), "got {:?}", err);

    match client.embed("hello").await.unwrap_err() {
        RagError::Embedding(message) => assert!(message.contains("403"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
#[ignore = "requires a running Ollama instance"]
async fn test_live_ollama_round_trip() {
    dotenv::dotenv().ok();
    let config = OllamaConfig::from_lookup(&|key: &str| std::env::var(key).ok());
    let client = OllamaClient::new(config, Duration::from_secs(120)).unwrap();

    let embedding = client.embed("The capital of France is Paris.").await.unwrap();
    assert!(embedding.dimension() > 0);

    let answer = client.generate("Say hello.").await.unwrap();
    assert!(!answer.trim().is_empty());
}
