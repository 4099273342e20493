mod common;

use common::{greedy, token_of, wait_ready, Fixture};
use ember_core::error::{EmberError, ErrorKind};
use ember_infer::{
    CompletionEvent, CompletionInput, CompletionParams, GrammarSpec, LoadConfig, LoadControl,
    SamplingParams, Session, SessionState, StopReason,
};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn prompt(text: &str) -> CompletionInput {
    CompletionInput::Prompt(text.to_string())
}

#[test]
fn load_reports_milestones_and_metadata() {
    let fx = Fixture::new();
    let (tx, rx) = mpsc::channel();
    let session = Session::load_with(
        &fx.model,
        LoadConfig::default(),
        LoadControl {
            progress: Some(tx),
            cancel: None,
        },
    )
    .unwrap();
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 10, 40, 70, 90, 100]);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.n_ctx(), common::CONTEXT as usize);

    let info = session.model_info().unwrap();
    assert_eq!(info.metadata.layer_count, common::LAYERS);
    assert_eq!(info.metadata.vocab_size as u64, common::vocab_size());
    assert_eq!(info.kv.get("general.name").map(String::as_str), Some("toy"));
    assert!(session.chat_template_available());
}

#[test]
fn tokenize_round_trips() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let text = "Hello world, 42 cats!";
    let tokens = session.tokenize(text, false, false).unwrap();
    assert_eq!(session.detokenize(&tokens).unwrap(), text);

    let with_bos = session.tokenize(text, true, false).unwrap();
    assert_eq!(with_bos[0], 1);
    assert_eq!(&with_bos[1..], &tokens[..]);
    assert_eq!(session.detokenize(&[]).unwrap(), "");

    // characters outside the letter set fall back to byte tokens
    let snow = session.tokenize("☃", false, false).unwrap();
    assert_eq!(session.detokenize(&snow).unwrap(), "☃");
}

#[test]
fn same_seed_same_output() {
    let fx = Fixture::new();
    let params = CompletionParams {
        sampling: SamplingParams {
            seed: 1234,
            temperature: 0.9,
            ignore_eos: true,
            ..Default::default()
        },
        n_predict: 12,
        ..Default::default()
    };
    let a = fx.default_session();
    let b = fx.default_session();
    let ra = a.complete(prompt("the cat sat"), params.clone()).unwrap().wait().unwrap();
    let rb = b.complete(prompt("the cat sat"), params).unwrap().wait().unwrap();
    assert_eq!(ra.tokens, rb.tokens);
    assert_eq!(ra.text, rb.text);
    assert_eq!(ra.seed, 1234);
    assert!(ra.tokens.len() >= 12 && ra.tokens.len() <= 15);
    assert_eq!(ra.stop_reason, StopReason::Limit);
    assert!(ra.stopped_limit && !ra.stopped_eos && !ra.stopped_word);
}

#[test]
fn stream_ends_with_one_result() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let events: Vec<_> = session.complete(prompt("abc"), greedy(5)).unwrap().collect();
    let done = events
        .iter()
        .filter(|e| matches!(e, CompletionEvent::Done(_)))
        .count();
    assert_eq!(done, 1);
    assert!(matches!(events.last(), Some(CompletionEvent::Done(_))));
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            CompletionEvent::Token(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect();
    let Some(CompletionEvent::Done(result)) = events.last() else {
        unreachable!()
    };
    assert_eq!(streamed, result.text);
    assert_eq!(result.tokens_evaluated, session.tokenize("abc", true, true).unwrap().len());
    assert_eq!(result.timings.predicted_n, result.tokens.len());
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn zero_predict_only_ingests() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let result = session.complete(prompt("abc"), greedy(0)).unwrap().wait().unwrap();
    assert!(result.tokens.is_empty());
    assert_eq!(result.stop_reason, StopReason::Limit);
    assert_eq!(session.cached_tokens().unwrap().len(), result.tokens_evaluated);
}

#[test]
fn stop_word_is_excluded() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let dot = token_of(".");
    let mut params = greedy(20);
    params.sampling.logit_bias = vec![(dot, 100.0)];
    params.sampling.n_probs = 3;
    params.stop = vec![".".into()];
    let result = session.complete(prompt("hello"), params).unwrap().wait().unwrap();
    assert_eq!(result.stop_reason, StopReason::Word);
    assert!(result.stopped_word);
    assert_eq!(result.stopping_word, ".");
    assert_eq!(result.text, "");
    assert_eq!(result.tokens, vec![dot]);
    assert_eq!(result.probs.len(), 1);
    assert_eq!(result.probs[0].top[0].token, dot);
    assert!(result.probs[0].top.len() <= 3);
}

#[test]
fn eos_stops_unless_ignored() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let mut params = greedy(10);
    params.sampling.ignore_eos = false;
    params.sampling.logit_bias = vec![(2, 100.0)];
    let result = session.complete(prompt("hi"), params.clone()).unwrap().wait().unwrap();
    assert_eq!(result.stop_reason, StopReason::Eos);
    assert!(result.stopped_eos);
    assert_eq!(result.tokens, vec![2]);

    params.sampling.ignore_eos = true;
    let result = session.complete(prompt("hi"), params).unwrap().wait().unwrap();
    assert!(!result.tokens.contains(&2));
}

#[test]
fn long_prompt_is_truncated() {
    let fx = Fixture::new();
    let session = fx.session(LoadConfig {
        n_ctx: 16,
        n_threads: 1,
        ..Default::default()
    });
    let text = "abcdefghijklmnopqrstuvwxyz";
    let result = session.complete(prompt(text), greedy(2)).unwrap().wait().unwrap();
    assert!(result.truncated);
    assert!(result.tokens_evaluated < 16);
    // a split character may extend the limit by up to three tokens
    assert!((2..=5).contains(&result.tokens.len()));
}

#[test]
fn context_shift_keeps_generating() {
    let fx = Fixture::new();
    let session = fx.session(LoadConfig {
        n_ctx: 16,
        n_threads: 1,
        ..Default::default()
    });
    let result = session.complete(prompt("ab"), greedy(30)).unwrap().wait().unwrap();
    assert_eq!(result.stop_reason, StopReason::Limit);
    assert!(result.tokens.len() >= 30);
    assert!(result.truncated);
    assert!(session.cached_tokens().unwrap().len() <= 16);

    let mut no_shift = greedy(30);
    no_shift.context_shift = false;
    let result = session.complete(prompt("ab"), no_shift).unwrap().wait().unwrap();
    assert_eq!(result.stop_reason, StopReason::ContextFull);
    assert!(result.stopped_limit);
}

#[test]
fn prefix_is_reused() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let first = session.complete(prompt("abcdef"), greedy(0)).unwrap().wait().unwrap();
    assert_eq!(first.tokens_cached, 0);
    let second = session.complete(prompt("abcdefgh"), greedy(1)).unwrap().wait().unwrap();
    assert_eq!(second.tokens_cached, first.tokens_evaluated);
    // identical prompt re-runs its last token
    let third = session.complete(prompt("abcdefgh"), greedy(0)).unwrap().wait().unwrap();
    assert_eq!(third.tokens_cached, third.tokens_evaluated - 1);
}

#[test]
fn one_completion_at_a_time() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let stream = session.complete(prompt("abc"), greedy(40)).unwrap();
    assert_eq!(session.state(), SessionState::Predicting);
    let err = session.complete(prompt("abc"), greedy(1)).unwrap_err();
    assert!(matches!(err, EmberError::AlreadyPredicting));
    assert!(matches!(
        session.save_session(&fx.path("busy.bin"), 0),
        Err(EmberError::AlreadyPredicting)
    ));
    // adapter changes wait for the session to be idle
    let adapter = fx.path("q.gguf");
    common::write_adapter(&adapter, "llama");
    assert!(matches!(
        session.apply_adapters(&[(adapter, 1.0)]),
        Err(EmberError::AlreadyPredicting)
    ));
    assert!(matches!(session.remove_adapters(), Err(EmberError::AlreadyPredicting)));
    // read-only operations still work
    assert!(session.tokenize("abc", false, false).is_ok());

    drop(stream);
    wait_ready(&session);
    assert!(session.complete(prompt("abc"), greedy(1)).unwrap().wait().is_ok());
}

#[test]
fn cache_queries_between_events_do_not_block() {
    let fx = Fixture::new();
    let session = Arc::new(fx.default_session());
    let mut stream = session.complete(prompt("abc"), greedy(20)).unwrap();
    assert!(matches!(stream.next(), Some(CompletionEvent::Token(_))));

    let (tx, rx) = mpsc::channel();
    let query = Arc::clone(&session);
    std::thread::spawn(move || {
        let _ = tx.send(query.cached_tokens());
    });
    let answer = rx.recv_timeout(Duration::from_secs(5)).expect("cached_tokens blocked");
    assert!(matches!(answer, Err(EmberError::AlreadyPredicting)));

    let result = stream.wait().unwrap();
    assert_eq!(
        session.cached_tokens().unwrap().len(),
        result.tokens_evaluated + result.tokens_predicted - 1
    );
}

#[test]
fn stop_cancels_at_step_boundary() {
    let fx = Fixture::new();
    let session = fx.default_session();
    session.stop();

    let mut stream = session.complete(prompt("abc"), greedy(-1)).unwrap();
    let mut seen = 0;
    let result = loop {
        match stream.next() {
            Some(CompletionEvent::Token(_)) => {
                seen += 1;
                if seen == 5 {
                    session.stop();
                    session.stop();
                }
            }
            Some(CompletionEvent::Done(r)) => break r,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert!(result.tokens.len() == 5 || result.tokens.len() == 6);
    assert!(stream.next().is_none());
    wait_ready(&session);
}

#[test]
fn stop_handle_works_across_threads() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let handle = session.stop_handle();
    let mut stream = session.complete(prompt("abc"), greedy(-1)).unwrap();
    assert!(matches!(stream.next(), Some(CompletionEvent::Token(_))));
    std::thread::spawn(move || handle.stop()).join().unwrap();
    let result = stream.wait().unwrap();
    assert_eq!(result.stop_reason, StopReason::Cancelled);
}

#[test]
fn grammar_constrains_output() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let mut params = greedy(10);
    params.sampling.ignore_eos = false;
    params.grammar = GrammarSpec {
        grammar: Some(r#"root ::= "yes" | "no""#.into()),
        ..Default::default()
    };
    let result = session.complete(prompt("answer"), params).unwrap().wait().unwrap();
    assert!(result.text == "yes" || result.text == "no", "{:?}", result.text);
    assert_eq!(result.stop_reason, StopReason::Eos);

    let mut bad = greedy(1);
    bad.grammar.grammar = Some("root ::= missing".into());
    assert_eq!(
        session.complete(prompt("x"), bad).unwrap_err().kind(),
        ErrorKind::GrammarCompileFailed
    );
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn chat_messages_render_through_template() {
    use ember_core::chat_template::{ChatMessage, Role};
    let fx = Fixture::new();
    let session = fx.session(LoadConfig {
        n_ctx: 512,
        n_threads: 1,
        ..Default::default()
    });
    let messages = vec![
        ChatMessage::new(Role::System, "be brief"),
        ChatMessage::new(Role::User, "hi"),
    ];
    let result = session
        .complete(CompletionInput::Chat(messages), greedy(3))
        .unwrap()
        .wait()
        .unwrap();
    let plain = session.tokenize("be brief\nhi", true, true).unwrap();
    assert!(!result.truncated);
    assert!(result.tokens_evaluated > plain.len());
}

#[test]
fn saved_session_continues_identically() {
    let fx = Fixture::new();
    let original = fx.default_session();
    original.complete(prompt("the cat sat on"), greedy(0)).unwrap().wait().unwrap();
    let file = fx.path("cat.session");
    let saved = original.save_session(&file, 0).unwrap();
    assert_eq!(saved, original.cached_tokens().unwrap().len());

    let restored = fx.default_session();
    let (loaded, text) = restored.load_session(&file).unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(text, "the cat sat on");
    assert_eq!(restored.cached_tokens().unwrap(), original.cached_tokens().unwrap());

    let a = original.complete(prompt("the cat sat on the"), greedy(8)).unwrap().wait().unwrap();
    let b = restored.complete(prompt("the cat sat on the"), greedy(8)).unwrap().wait().unwrap();
    assert_eq!(a.tokens, b.tokens);
    assert_eq!(a.tokens_cached, b.tokens_cached);
    assert_eq!(b.tokens_cached, saved);
}

#[test]
fn session_files_are_checked() {
    let fx = Fixture::new();
    let session = fx.default_session();
    assert_eq!(
        session.save_session(&fx.path("empty.bin"), 0).unwrap_err().kind(),
        ErrorKind::SessionSaveFailed
    );

    session.complete(prompt("abcdef"), greedy(0)).unwrap().wait().unwrap();
    let file = fx.path("tail.bin");
    assert_eq!(session.save_session(&file, 3).unwrap(), 3);
    let (n, _) = session.load_session(&file).unwrap();
    assert_eq!(n, 3);
    assert_eq!(session.cached_tokens().unwrap().len(), 3);

    let junk = fx.path("junk.bin");
    std::fs::write(&junk, b"not a session").unwrap();
    assert_eq!(session.load_session(&junk).unwrap_err().kind(), ErrorKind::SessionLoadFailed);
    assert_eq!(session.cached_tokens().unwrap().len(), 3);
    assert_eq!(
        session.load_session(&fx.path("missing.bin")).unwrap_err().kind(),
        ErrorKind::Io
    );
}

#[test]
fn adapters_apply_all_or_nothing() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let adapter = fx.path("q.gguf");
    common::write_adapter(&adapter, "llama");
    let baseline = session.complete(prompt("abc"), greedy(6)).unwrap().wait().unwrap();

    session.apply_adapters(&[(adapter.clone(), 0.0)]).unwrap();
    let listed = session.list_adapters().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].scale, 0.0);
    let muted = session.complete(prompt("abc"), greedy(6)).unwrap().wait().unwrap();
    assert_eq!(muted.tokens, baseline.tokens);
    assert_eq!(muted.tokens_cached, 0);

    let err = session
        .apply_adapters(&[(adapter.clone(), 1.0), (PathBuf::from("/nonexistent.gguf"), 1.0)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoraApplyFailed);
    assert_eq!(session.list_adapters().unwrap()[0].scale, 0.0);

    let wrong = fx.path("wrong.gguf");
    common::write_adapter(&wrong, "gemma");
    assert!(session.apply_adapters(&[(wrong, 1.0)]).is_err());

    session.remove_adapters().unwrap();
    assert!(session.list_adapters().unwrap().is_empty());
}

#[test]
fn removing_adapters_restores_base_output() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let head = fx.path("head.gguf");
    common::write_head_adapter(&head);
    let baseline = session.complete(prompt("abc"), greedy(8)).unwrap().wait().unwrap();

    session.apply_adapters(&[(head, 1.0)]).unwrap();
    let adapted = session.complete(prompt("abc"), greedy(8)).unwrap().wait().unwrap();
    assert_ne!(adapted.tokens, baseline.tokens);
    assert_eq!(adapted.tokens_cached, 0);

    session.remove_adapters().unwrap();
    let restored = session.complete(prompt("abc"), greedy(8)).unwrap().wait().unwrap();
    assert_eq!(restored.tokens, baseline.tokens);
    assert_eq!(restored.tokens_cached, 0);
}

#[test]
fn embeddings_need_embedding_mode() {
    let fx = Fixture::new();
    let plain = fx.default_session();
    assert_eq!(plain.embed("hello", -1).unwrap_err().kind(), ErrorKind::EmbeddingFailed);

    let session = fx.session(LoadConfig {
        embedding: true,
        n_threads: 1,
        ..Default::default()
    });
    let unit = session.embed("hello", -1).unwrap();
    assert_eq!(unit.len(), common::DIM as usize);
    let norm: f32 = unit.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-4);

    let raw = session.embed("hello", 0).unwrap();
    assert_eq!(raw.len(), unit.len());
    assert_eq!(session.embed("hello", 7).unwrap_err().kind(), ErrorKind::EmbeddingFailed);
    assert_eq!(session.embed("hello", 1).unwrap(), unit);
}

#[test]
fn vocab_only_sessions_tokenize() {
    let fx = Fixture::new();
    let session = fx.session(LoadConfig {
        vocab_only: true,
        ..Default::default()
    });
    assert!(!session.tokenize("abc", true, false).unwrap().is_empty());
    assert_eq!(
        session.complete(prompt("abc"), greedy(1)).unwrap_err().kind(),
        ErrorKind::InvalidContext
    );
}

#[test]
fn closed_session_rejects_everything() {
    let fx = Fixture::new();
    let session = fx.default_session();
    session.close();
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    for err in [
        session.complete(prompt("abc"), greedy(1)).unwrap_err(),
        session.tokenize("abc", false, false).unwrap_err(),
        session.model_info().unwrap_err(),
        session.save_session(&fx.path("s.bin"), 0).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::InvalidContext);
    }
}

#[test]
fn bench_reports_rates() {
    let fx = Fixture::new();
    let session = fx.default_session();
    let report = session.bench(8, 4, 2, 2).unwrap();
    assert_eq!((report.pp, report.tg, report.pl, report.nr), (8, 4, 2, 2));
    assert!(report.pp_avg > 0.0 && report.tg_avg > 0.0);
    assert!(report.parameters > 0);
    assert!(session.bench(60, 10, 1, 1).is_err());
    assert!(session.cached_tokens().unwrap().is_empty());
}
