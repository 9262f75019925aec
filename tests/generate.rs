use serde_json::{Value, json};
use sigforge::ai::{ContentPart, FunctionCall, FunctionCallDelta, Role};
use sigforge::prelude::*;
use sigforge::{
    AiFeatures, CancellationToken, ChatDelta, ChatResponse, HandlerError, MemoryTelemetry,
    RenderError, Usage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn weather_registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with(
            FunctionSpec::new(
                "getWeather",
                "Current weather for a city",
                sync_function_fn(|args| {
                    assert_eq!(args["city"], "Tokyo");
                    Ok(json!("18C"))
                }),
            )
            .parameters(json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })),
        )
        .unwrap()
}

fn not_five() -> Assertion {
    Assertion::on_field("count", "count must not be 5", |v: &Value| v != &json!(5))
}

#[tokio::test]
async fn test_plain_answer() {
    let ai = MockAi::new();
    ai.queue_text("Answer: Paris");

    let generator = Generator::new("question:string -> answer:string").unwrap();
    let output = generator
        .forward(&ai, json!({"question": "Capital of France?"}))
        .await
        .unwrap();

    assert_eq!(output.values, json!({"answer": "Paris"}).as_object().cloned().unwrap());
    assert_eq!(output.model_calls, 1);
    assert_eq!(output.retries, 0);
}

#[tokio::test]
async fn test_streamed_list_across_chunks() {
    let ai = MockAi::new();
    ai.queue_chunks(["Items:\n- a\n- ", "b\n- c"]);

    let generator = Generator::builder(signature!("n:number -> items:string[]"))
        .stream(true)
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"n": 3})).await.unwrap();

    assert_eq!(output.get("items"), Some(&json!(["a", "b", "c"])));
}

#[tokio::test]
async fn test_assertion_failure_triggers_one_correction() {
    let ai = MockAi::new();
    ai.queue_text("count: 5");
    ai.queue_text("count: 3");

    let generator = Generator::builder(signature!("topic -> count:number"))
        .assert(not_five())
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"topic": "apples"})).await.unwrap();

    assert_eq!(output.get("count"), Some(&json!(3)));
    assert_eq!(output.retries, 1);
    assert_eq!(ai.call_count(), 2);

    let retry = &ai.requests()[1].messages;
    assert_eq!(retry.len(), 4);
    assert_eq!(retry[2].role, Role::Assistant);
    assert_eq!(retry[2].text(), "count: 5");
    assert_eq!(retry[3].role, Role::User);
    let correction = retry[3].text();
    assert!(correction.contains("Field: `Count`"));
    assert!(correction.contains("Value: 5"));
    assert!(correction.contains("count must not be 5"));
}

#[tokio::test]
async fn test_function_call_then_answer() {
    let ai = MockAi::new();
    ai.queue_function_call("getWeather", json!({"city": "Tokyo"}));
    ai.queue_text("Answer: 18C");

    let generator = Generator::builder(signature!("question -> answer"))
        .functions(weather_registry())
        .build()
        .unwrap();
    let output = generator
        .forward(&ai, json!({"question": "Weather in Tokyo?"}))
        .await
        .unwrap();

    assert_eq!(output.function_calls.len(), 1);
    assert_eq!(output.function_calls[0].result, Ok("18C".to_string()));
    assert_eq!(output.get_str("answer"), Some("18C"));
    assert_eq!(ai.call_count(), 2);
    assert_eq!(output.steps, 2);

    let requests = ai.requests();
    assert_eq!(requests[0].functions.len(), 1);
    let second = &requests[1].messages;
    assert_eq!(second[2].function_calls.len(), 1);
    assert_eq!(second[3].role, Role::Function);
    assert_eq!(second[3].function_call_id, Some(second[2].function_calls[0].id.clone()));
    assert_eq!(second[3].text(), "18C");
}

#[tokio::test]
async fn test_bad_arguments_are_reported_to_the_model() {
    let ai = MockAi::new();
    ai.queue_function_call("getWeather", json!({"town": "Tokyo"}));
    ai.queue_text("Answer: unknown");

    let generator = Generator::builder(signature!("question -> answer"))
        .functions(weather_registry())
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"question": "?"})).await.unwrap();

    assert!(output.function_calls[0].is_error());
    let result_message = &ai.requests()[1].messages[3];
    assert!(result_message.is_error);
    assert!(result_message.text().contains("city"));
}

#[tokio::test]
async fn test_fatal_function_failure_aborts() {
    let ai = MockAi::new();
    ai.queue_function_call("charge", json!({}));

    let registry = FunctionRegistry::new()
        .with(
            FunctionSpec::new(
                "charge",
                "Charge the card",
                function_fn(|_| async { Err::<Value, _>(HandlerError::from("card declined")) }),
            )
            .fatal(),
        )
        .unwrap();
    let generator = Generator::builder(signature!("order -> receipt"))
        .functions(registry)
        .build()
        .unwrap();
    let err = generator.forward(&ai, json!({"order": "#1"})).await.unwrap_err();

    let GenError::FunctionExecution { name, message } = err else {
        panic!("expected a function failure, got {err:?}");
    };
    assert_eq!((name.as_str(), message.as_str()), ("charge", "card declined"));
}

#[tokio::test]
async fn test_max_steps_exceeded() {
    let ai = MockAi::new();
    for _ in 0..5 {
        ai.queue_function_call("getWeather", json!({"city": "Tokyo"}));
    }

    let generator = Generator::builder(signature!("question -> answer"))
        .functions(weather_registry())
        .max_steps(2)
        .build()
        .unwrap();
    let err = generator.forward(&ai, json!({"question": "?"})).await.unwrap_err();

    assert!(matches!(err, GenError::MaxStepsExceeded { max_steps: 2 }));
    // The first model call is step one.
    assert_eq!(ai.call_count(), 2);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let ai = MockAi::new();
    for _ in 0..6 {
        ai.queue_text("Count: 5");
    }

    let generator = Generator::builder(signature!("topic -> count:number"))
        .assert(not_five())
        .max_retries(2)
        .build()
        .unwrap();
    let err = generator.forward(&ai, json!({"topic": "x"})).await.unwrap_err();

    match err {
        GenError::Validation {
            field,
            value,
            attempts,
            raw_output,
            ..
        } => {
            assert_eq!(field.as_deref(), Some("count"));
            assert_eq!(value.as_deref(), Some("5"));
            assert_eq!(attempts, 3);
            assert_eq!(raw_output, "Count: 5");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ai.call_count(), 3);
    assert_eq!(ai.remaining(), 3);
}

#[tokio::test]
async fn test_coercion_failure_is_retried() {
    let ai = MockAi::new();
    ai.queue_text("Count: many");
    ai.queue_text("Count: 7");

    let generator = Generator::new("topic -> count:number").unwrap();
    let output = generator.forward(&ai, json!({"topic": "x"})).await.unwrap();

    assert_eq!(output.get("count"), Some(&json!(7)));
    let correction = ai.requests()[1].messages[3].text();
    assert!(correction.contains("Invalid value for Count"));
}

#[tokio::test]
async fn test_missing_required_field_is_retried() {
    let ai = MockAi::new();
    ai.queue_text("Answer: yes");
    ai.queue_text("Answer: yes\nScore: 0.9");

    let generator = Generator::new("q -> answer, score:number").unwrap();
    let output = generator.forward(&ai, json!({"q": "?"})).await.unwrap();

    assert_eq!(output.get("score"), Some(&json!(0.9)));
    let correction = ai.requests()[1].messages[3].text();
    assert!(correction.contains("Required field not found: Score"));
}

#[tokio::test]
async fn test_stop_function_ends_the_loop() {
    let ai = MockAi::new();
    ai.queue_function_call("finish", json!({"summary": "all done"}));

    let registry = FunctionRegistry::new()
        .with(FunctionSpec::new(
            "finish",
            "Report the final result",
            sync_function_fn(|args| Ok(args["summary"].clone())),
        ))
        .unwrap();
    let generator = Generator::builder(signature!("task -> summary"))
        .functions(registry)
        .stop_function("Finish")
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"task": "wrap up"})).await.unwrap();

    let stopped = output.stopped_by.expect("stopped by finish");
    assert_eq!(stopped.name, "finish");
    assert_eq!(stopped.result, Ok("all done".to_string()));
    assert_eq!(ai.call_count(), 1);
    assert!(output.values.is_empty());
}

#[tokio::test]
async fn test_missing_input_makes_no_model_call() {
    let ai = MockAi::new();
    ai.queue_text("Answer: x");

    let generator = Generator::new("context, question -> answer").unwrap();
    let err = generator.forward(&ai, json!({"question": "?"})).await.unwrap_err();

    assert!(matches!(
        err,
        GenError::Render(RenderError::MissingInput { field }) if field == "context"
    ));
    assert_eq!(ai.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let ai = MockAi::new();
    ai.queue_text("Answer: x");
    let token = CancellationToken::new();
    token.cancel();

    let generator = Generator::new("q -> answer").unwrap();
    let err = generator
        .forward_with(&ai, json!({"q": "?"}), RunOptions::new().cancel_token(token))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(ai.remaining(), 1);
}

#[tokio::test]
async fn test_cancel_during_model_call() {
    let ai = MockAi::new().with_delay(Duration::from_secs(30));
    ai.queue_text("Count: 5");
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let generator = Generator::builder(signature!("topic -> count:number"))
        .assert(not_five())
        .build()
        .unwrap();
    let err = generator
        .forward_with(&ai, json!({"topic": "x"}), RunOptions::new().cancel_token(token))
        .await
        .unwrap_err();

    assert!(matches!(err, GenError::Cancelled));
    assert_eq!(ai.call_count(), 1);
}

#[tokio::test]
async fn test_cancel_while_consuming_the_stream() {
    let ai = MockAi::new().with_chunk_delay(Duration::from_millis(20));
    ai.queue_chunks(["Answer: 42\n", "Notes: a", " b", " c", " d", " e"]);
    let token = CancellationToken::new();
    let trigger = token.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = tokio::spawn(async move {
        let first = rx.recv().await;
        trigger.cancel();
        first
    });

    let generator = Generator::builder(signature!("q -> answer:number, notes"))
        .stream(true)
        .build()
        .unwrap();
    let options = RunOptions::new().cancel_token(token).events(tx);
    let err = generator.forward_with(&ai, json!({"q": "?"}), options).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(ai.call_count(), 1);
    let first = watcher.await.unwrap();
    assert!(matches!(
        first,
        Some(GenerationEvent::FieldFinalized { ref name, .. }) if name == "answer"
    ));
}

#[tokio::test]
async fn test_cancel_while_a_function_runs() {
    let ai = MockAi::new();
    ai.queue_function_call("lookup", json!({}));
    ai.queue_text("Answer: never");
    let token = CancellationToken::new();
    let trigger = token.clone();

    let registry = FunctionRegistry::new()
        .with(FunctionSpec::new(
            "lookup",
            "Slow lookup",
            function_fn(move |_| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, HandlerError>(json!("late"))
                }
            }),
        ))
        .unwrap();
    let generator = Generator::builder(signature!("question -> answer"))
        .functions(registry)
        .build()
        .unwrap();
    let err = generator
        .forward_with(&ai, json!({"question": "?"}), RunOptions::new().cancel_token(token))
        .await
        .unwrap_err();

    assert!(matches!(err, GenError::Cancelled));
    assert_eq!(ai.call_count(), 1);
    assert_eq!(ai.remaining(), 1);
}

#[tokio::test]
async fn test_streamed_function_call_fragments() {
    let ai = MockAi::new();
    ai.queue_stream(vec![
        ChatDelta {
            function_calls: vec![FunctionCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("getWeather".into()),
                arguments: Some(r#"{"ci"#.into()),
            }],
            ..Default::default()
        },
        ChatDelta {
            function_calls: vec![FunctionCallDelta {
                index: 0,
                arguments: Some(r#"ty": "Tokyo"}"#.into()),
                ..Default::default()
            }],
            ..Default::default()
        },
    ]);
    ai.queue_chunks(["Answer: ", "18C"]);

    let generator = Generator::builder(signature!("question -> answer"))
        .functions(weather_registry())
        .stream(true)
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"question": "?"})).await.unwrap();

    assert_eq!(output.get_str("answer"), Some("18C"));
    assert_eq!(output.function_calls.len(), 1);
    assert_eq!(output.function_calls[0].id, "c1");
    assert_eq!(output.function_calls[0].args, json!({"city": "Tokyo"}));

    let second = &ai.requests()[1].messages;
    assert_eq!(second[2].function_calls[0].arguments, r#"{"city": "Tokyo"}"#);
    assert_eq!(second[3].function_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_calls_in_one_turn_run_together() {
    let ai = MockAi::new();
    ai.queue_response(ChatResponse::calls(vec![
        FunctionCall::new("a", "slow", r#"{"n": 1}"#),
        FunctionCall::new("b", "slow", r#"{"n": 2}"#),
    ]));
    ai.queue_text("Answer: done");

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (now, max) = (running.clone(), peak.clone());
    let registry = FunctionRegistry::new()
        .with(FunctionSpec::new(
            "slow",
            "Takes a while",
            function_fn(move |args| {
                let (now, max) = (now.clone(), max.clone());
                async move {
                    let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    now.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(args["n"].clone())
                }
            }),
        ))
        .unwrap();
    let generator = Generator::builder(signature!("question -> answer"))
        .functions(registry)
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"question": "?"})).await.unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(running.load(Ordering::SeqCst), 0);
    assert_eq!(output.steps, 2);

    // Both results arrive before the next model call, in call order.
    let second = &ai.requests()[1].messages;
    assert_eq!(second.len(), 5);
    assert_eq!(second[2].function_calls.len(), 2);
    assert_eq!(second[3].function_call_id.as_deref(), Some("a"));
    assert_eq!(second[3].text(), "1");
    assert_eq!(second[4].function_call_id.as_deref(), Some("b"));
    assert_eq!(second[4].text(), "2");
}

#[tokio::test]
async fn test_streaming_events_are_monotonic() {
    let ai = MockAi::new();
    ai.queue_chunks(["Answer: 4", "2\nNot", "es: fine"]);

    let generator = Generator::builder(signature!("q -> answer:number, notes"))
        .stream(true)
        .build()
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let output = generator
        .forward_with(&ai, json!({"q": "?"}), RunOptions::new().events(tx))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            GenerationEvent::FieldFinalized {
                attempt: 0,
                name: "answer".into(),
                value: json!(42)
            },
            GenerationEvent::FieldFinalized {
                attempt: 0,
                name: "notes".into(),
                value: json!("fine")
            },
        ]
    );
    assert_eq!(output.get("answer"), Some(&json!(42)));
}

#[tokio::test]
async fn test_streaming_assertion_abandons_the_stream() {
    let ai = MockAi::new();
    ai.queue_chunks(["Count: 5\nNo", "tes: first", " try"]);
    ai.queue_chunks(["Count: 3\nNotes: second try"]);

    let generator = Generator::builder(signature!("topic -> count:number, notes"))
        .stream(true)
        .assert(not_five().streaming())
        .build()
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let output = generator
        .forward_with(&ai, json!({"topic": "x"}), RunOptions::new().events(tx))
        .await
        .unwrap();

    assert_eq!(output.get("count"), Some(&json!(3)));
    assert_eq!(output.get_str("notes"), Some("second try"));
    // The rejected stream was dropped before its last chunk.
    assert_eq!(ai.requests()[1].messages[2].text(), "Count: 5\nNotes: first");

    let mut retries = 0;
    while let Ok(event) = rx.try_recv() {
        if let GenerationEvent::Retry { attempt, message } = event {
            assert_eq!(attempt, 1);
            assert_eq!(message, "count must not be 5");
            retries += 1;
        }
    }
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn test_usage_is_summed_across_calls() {
    let ai = MockAi::new();
    ai.queue_response(ChatResponse::text("Count: 5").with_usage(Usage::new(10, 2)));
    ai.queue_response(ChatResponse::text("Count: 1").with_usage(Usage::new(12, 3)));

    let generator = Generator::builder(signature!("topic -> count:number"))
        .assert(not_five())
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"topic": "x"})).await.unwrap();

    assert_eq!(output.usage, Usage::new(22, 5));
    assert_eq!(output.model_calls, 2);
}

#[tokio::test]
async fn test_thought_field_stays_internal() {
    let ai = MockAi::new();
    ai.queue_text("Reasoning: two plus two\nAnswer: 4");

    let generator = Generator::builder(signature!("question -> answer"))
        .thought_field("reasoning")
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"question": "2+2?"})).await.unwrap();

    assert_eq!(output.values.len(), 1);
    assert_eq!(output.get_str("answer"), Some("4"));
    assert_eq!(output.internal["reasoning"], "two plus two");
}

#[tokio::test]
async fn test_demos_precede_the_live_turn() {
    let ai = MockAi::new();
    ai.queue_text("Answer: 6");

    let demo = Demo::new(
        json!({"question": "2+2?"}).as_object().cloned().unwrap(),
        json!({"answer": "4"}).as_object().cloned().unwrap(),
    );
    let generator = Generator::builder(signature!("question -> answer"))
        .demo(demo)
        .build()
        .unwrap();
    generator.forward(&ai, json!({"question": "3+3?"})).await.unwrap();

    let messages = &ai.requests()[0].messages;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].text(), "Answer: 4");
    assert_eq!(messages[3].text(), "Question: 3+3?");
}

#[tokio::test]
async fn test_image_inputs_reach_the_backend() {
    let ai = MockAi::new();
    ai.queue_text("Caption: a cat");

    let generator = Generator::new("photo:image -> caption").unwrap();
    generator
        .forward(&ai, json!({"photo": {"mimeType": "image/jpeg", "data": "/9j/4AAQ"}}))
        .await
        .unwrap();

    let user = &ai.requests()[0].messages[1];
    assert!(user
        .parts
        .iter()
        .any(|p| matches!(p, ContentPart::Image { mime_type, .. } if mime_type == "image/jpeg")));
}

#[tokio::test]
async fn test_functions_hidden_from_backends_without_support() {
    let ai = MockAi::new().with_features(AiFeatures {
        functions: false,
        ..Default::default()
    });
    ai.queue_text("Answer: ok");

    let generator = Generator::builder(signature!("question -> answer"))
        .functions(weather_registry())
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"question": "?"})).await.unwrap();

    assert_eq!(output.get_str("answer"), Some("ok"));
    let request = &ai.requests()[0];
    assert!(request.functions.is_empty());
    // Functions are offered as fields to write instead of native calls.
    let system = request.messages[0].text();
    assert!(system.contains("- `Get Weather`: Current weather for a city. Arguments:"));
    assert!(system.contains("write its title as a field header followed by a JSON object"));
    assert!(!system.contains("Call functions step-by-step"));
}

#[tokio::test]
async fn test_function_called_through_the_prompt() {
    let ai = MockAi::new().with_features(AiFeatures {
        functions: false,
        ..Default::default()
    });
    ai.queue_text(r#"Get Weather: {"city": "Tokyo"}"#);
    ai.queue_text("Answer: 18C");

    let generator = Generator::builder(signature!("question -> answer"))
        .functions(weather_registry())
        .build()
        .unwrap();
    let output = generator
        .forward(&ai, json!({"question": "Weather in Tokyo?"}))
        .await
        .unwrap();

    assert_eq!(output.get_str("answer"), Some("18C"));
    assert_eq!(output.steps, 2);
    assert_eq!(output.function_calls.len(), 1);
    assert_eq!(output.function_calls[0].args, json!({"city": "Tokyo"}));
    assert!(!output.values.contains_key("getWeather"));

    let second = &ai.requests()[1].messages;
    assert_eq!(second.len(), 4);
    assert_eq!(second[2].role, Role::Assistant);
    assert!(second[2].function_calls.is_empty());
    assert_eq!(second[2].text(), r#"Get Weather: {"city": "Tokyo"}"#);
    assert_eq!(second[3].role, Role::User);
    assert!(second[3].text().contains("Function results:"));
    assert!(second[3].text().contains("`getWeather`: 18C"));
}

#[tokio::test]
async fn test_field_processors() {
    let ai = MockAi::new();
    ai.queue_text("Answer: paris");

    let generator = Generator::builder(signature!("question -> answer"))
        .processor(FieldProcessor::new("answer", |v, ctx| {
            assert!(ctx.done);
            Some(json!(v.as_str()?.to_uppercase()))
        }))
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"question": "?"})).await.unwrap();

    assert_eq!(output.get_str("answer"), Some("paris"));
    assert_eq!(output.processed.get("answer"), Some(&json!("PARIS")));
}

#[tokio::test]
async fn test_streaming_processor_sees_growing_text() {
    let ai = MockAi::new();
    ai.queue_chunks(["Notes: one", " two", " three\nAnswer: 3"]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let generator = Generator::builder(signature!("q -> notes, answer:number"))
        .stream(true)
        .processor(FieldProcessor::streaming("notes", move |text, ctx| {
            let words = text.split_whitespace().count();
            sink.lock().unwrap().push((words, ctx.done));
            Some(json!(words))
        }))
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"q": "?"})).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&(1, false)));
    assert_eq!(seen.last(), Some(&(3, true)));
    assert!(seen[..seen.len() - 1].iter().all(|(_, done)| !done));
    assert_eq!(output.processed.get("notes"), Some(&json!(3)));
}

#[tokio::test]
async fn test_processed_fields_are_reported_on_retry() {
    let ai = MockAi::new();
    ai.queue_chunks(["Notes: hi there\nCount: 5"]);
    ai.queue_chunks(["Notes: ok\nCount: 3"]);

    let generator = Generator::builder(signature!("topic -> notes, count:number"))
        .stream(true)
        .assert(not_five())
        .processor(FieldProcessor::streaming("notes", |text, _| Some(json!(text.len()))))
        .build()
        .unwrap();
    let output = generator.forward(&ai, json!({"topic": "x"})).await.unwrap();

    assert_eq!(output.get("count"), Some(&json!(3)));
    assert_eq!(output.processed.get("notes"), Some(&json!(2)));

    let second = &ai.requests()[1].messages;
    assert_eq!(second.len(), 5);
    assert!(second[3].text().starts_with(r#"The field "Notes" was processed."#));
    assert!(second[3].text().ends_with("8"));
    assert!(second[4].text().contains("count must not be 5"));
}

#[tokio::test]
async fn test_telemetry_records_every_call() {
    let telemetry = Arc::new(MemoryTelemetry::new());
    let ai = MockAi::new();
    ai.queue_text("Answer: Paris");

    let generator = Generator::builder(signature!("question -> answer"))
        .telemetry(telemetry.clone())
        .model("tiny")
        .build()
        .unwrap();
    generator.forward(&ai, json!({"question": "?"})).await.unwrap();
    // Queue is empty now, so the backend fails.
    assert!(matches!(
        generator.forward(&ai, json!({"question": "?"})).await,
        Err(GenError::Ai(_))
    ));

    let traces = telemetry.traces();
    assert_eq!(traces.len(), 2);
    assert!(traces[0].succeeded());
    assert_eq!(traces[0].outputs["answer"], "Paris");
    assert_eq!(traces[0].model_name.as_deref(), Some("tiny"));
    assert_eq!(traces[0].signature_hash, generator.signature().structural_hash());
    assert!(traces[1].error.is_some());
}

#[tokio::test]
async fn test_generator_is_shareable_across_tasks() {
    let generator = Arc::new(Generator::new("question -> answer").unwrap());
    let mut handles = Vec::new();
    for i in 0..4 {
        let generator = generator.clone();
        handles.push(tokio::spawn(async move {
            let ai = MockAi::new();
            ai.queue_text(format!("Answer: {i}"));
            generator
                .forward(&ai, json!({"question": "?"}))
                .await
                .map(|out| out.get_str("answer").map(str::to_string))
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), Some(i.to_string()));
    }
}
