//! Behaviour every client shares: local validation, daemon absence, reply
//! decoding and stream bookkeeping.

mod util;

use std::sync::Arc;

use ai_daemon_client::bus::{BusValue, MemoryBus};
use ai_daemon_client::{
    AiError, ChatClient, ClientConfig, EmbeddingClient, ErrorCode, FunctionCallingClient,
    ImageRecognitionClient, ModelManager, OcrClient, Params, SpeechToTextClient,
    TextToSpeechClient,
};
use proptest::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;
use util::absent_daemon_config;

fn assert_unavailable<T: std::fmt::Debug>(result: Result<T, AiError>) {
    match result {
        Err(AiError::DaemonUnavailable(_)) => {}
        other => panic!("expected daemon-unavailable, got {other:?}"),
    }
}

fn unavailable_code() -> i32 {
    ErrorCode::ApiServerNotAvailable.as_i32()
}

#[test]
fn every_client_reports_absent_daemon() {
    let dir = TempDir::new().unwrap();
    let config = absent_daemon_config(&dir);
    let params = Params::new();

    let chat = ChatClient::connect(&config);
    assert_unavailable(chat.chat("hello", &[], &params));
    assert_eq!(chat.last_error().code, unavailable_code());
    assert_unavailable(chat.chat_stream("hello", &[], &params));
    assert!(!chat.is_running());

    let ocr = OcrClient::connect(&config);
    assert_unavailable(ocr.recognize_file("/scans/page.png", &params));
    assert_eq!(ocr.last_error().code, unavailable_code());

    let image = ImageRecognitionClient::connect(&config);
    assert_unavailable(image.recognize_image_url("https://example.com/cat.jpg", "what is it", &params));
    assert_eq!(image.last_error().code, unavailable_code());

    let stt = SpeechToTextClient::connect(&config);
    assert_unavailable(stt.start_stream_recognition(&params));
    assert!(stt.stream_id().is_none());

    let tts = TextToSpeechClient::connect(&config);
    assert_unavailable(tts.synthesize_text("hello", &params));
    assert_unavailable(tts.start_stream_synthesis("hello", &params));
    assert!(tts.accumulated().is_empty());

    let fc = FunctionCallingClient::connect(&config);
    assert_unavailable(fc.parse("open it", r#"[{"name":"open"}]"#, &params));

    let embedding = EmbeddingClient::connect(&config);
    assert_unavailable(embedding.search("notes", "rust", ""));
    assert_eq!(embedding.last_error().code, unavailable_code());

    let models = ModelManager::connect(&config);
    assert_unavailable(models.available_models(None));
    assert_eq!(models.last_error().code, unavailable_code());
}

#[test]
fn relative_paths_never_reach_the_daemon() {
    let bus = Arc::new(MemoryBus::with_session_manager());
    let config = ClientConfig::default();
    let params = Params::new();

    let ocr = OcrClient::new(bus.clone(), &config);
    let err = ocr.recognize_file("relative/path.png", &params).unwrap_err();
    assert!(matches!(err, AiError::InvalidParameter(_)));
    assert_eq!(ocr.last_error().code, ErrorCode::InvalidParameter.as_i32());
    assert!(matches!(
        ocr.recognize_region("relative/path.png", "0,0,10,10", &params),
        Err(AiError::InvalidParameter(_))
    ));

    let image = ImageRecognitionClient::new(bus.clone(), &config);
    assert!(matches!(
        image.recognize_image("cat.jpg", "what is it", &params),
        Err(AiError::InvalidParameter(_))
    ));

    let stt = SpeechToTextClient::new(bus.clone(), &config);
    assert!(matches!(
        stt.recognize_file("memo.wav", &params),
        Err(AiError::InvalidParameter(_))
    ));

    assert!(bus.calls().is_empty(), "unexpected calls: {:?}", bus.calls());
}

#[test]
fn malformed_replies_are_parse_errors() {
    let bus = Arc::new(MemoryBus::with_session_manager());
    bus.reply_json("recognizeFile", "{\"text\": \"unterminated");
    bus.reply_json("recognizeImageUrl", "[1, 2, 3]");
    let config = ClientConfig::default();

    let ocr = OcrClient::new(bus.clone(), &config);
    let err = ocr.recognize_file("/scans/page.png", &Params::new()).unwrap_err();
    assert!(matches!(err, AiError::Parse(_)));
    assert_eq!(ocr.last_error().code, ErrorCode::ParseError.as_i32());

    let image = ImageRecognitionClient::new(bus.clone(), &config);
    let err = image
        .recognize_image_url("https://example.com/cat.jpg", "what is it", &Params::new())
        .unwrap_err();
    assert!(matches!(err, AiError::Parse(_)));
}

#[test]
fn ending_streams_that_never_started_is_a_noop() {
    let bus = Arc::new(MemoryBus::with_session_manager());
    let config = ClientConfig::default();

    let stt = SpeechToTextClient::new(bus.clone(), &config);
    assert_eq!(stt.end_stream_recognition().unwrap(), "");
    let tts = TextToSpeechClient::new(bus.clone(), &config);
    assert!(tts.end_stream_synthesis().unwrap().is_empty());

    assert!(!stt.last_error().is_error());
    assert!(!tts.last_error().is_error());
    assert!(bus.calls().is_empty());
}

#[test]
fn successful_call_clears_previous_error() {
    let bus = Arc::new(MemoryBus::with_session_manager());
    bus.reply_json("chat", r#"{"error_code": 7, "error_message": "model loading"}"#);
    let chat = ChatClient::new(bus.clone(), &ClientConfig::default());

    assert_eq!(chat.chat("hi", &[], &Params::new()).unwrap_err().code(), 7);
    assert_eq!(chat.last_error().message, "model loading");

    bus.reply_json("chat", r#"{"content": "ready now"}"#);
    assert_eq!(chat.chat("hi", &[], &Params::new()).unwrap(), "ready now");
    assert!(!chat.last_error().is_error());
}

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _.-]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn params_strategy() -> impl Strategy<Value = Params> {
    prop::collection::btree_map("[a-z_]{1,8}", json_value(), 0..6)
        .prop_map(|m| m.into_iter().collect::<Params>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn params_survive_a_daemon_echo(params in params_strategy()) {
        let bus = Arc::new(MemoryBus::with_session_manager());
        bus.on("recognizeFile", |_path, args| {
            let packaged = match args.get(1) {
                Some(BusValue::Str(s)) => s.clone(),
                _ => String::new(),
            };
            Ok(BusValue::from(json!({ "text": packaged }).to_string()))
        });
        let ocr = OcrClient::new(bus.clone(), &ClientConfig::default());

        let echoed = ocr.recognize_file("/scans/page.png", &params).unwrap();
        let decoded: Params = serde_json::from_str(&echoed).unwrap();
        prop_assert_eq!(decoded, params);
    }
}
