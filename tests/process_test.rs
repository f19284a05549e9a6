#![cfg(unix)]

mod common;

use claude_bridge::{
    BridgeError, CliBinary, CliEvent, CliProcess, InvocationDescriptor, InvocationState,
    ModelAlias, Usage,
};
use common::{
    FakeCli, ERROR_RESULT, FAILS_MIDWAY, FLOODS_THEN_HANGS, GARBLED_STDOUT, HANGS, NOISY_STDERR,
    SILENT_EXIT, SUCCESS,
};
use futures::StreamExt;
use std::time::Duration;

async fn drain(mut process: CliProcess) -> Vec<Result<CliEvent, BridgeError>> {
    let mut events = Vec::new();
    while let Some(event) = process.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_successful_invocation_streams_in_order() {
    let fake = FakeCli::new(SUCCESS);
    let mut desc = InvocationDescriptor::new("What is 2+2?", ModelAlias::Sonnet);
    desc.system_prompt = Some("Be terse".into());
    desc.session_id = Some("conv-42".into());

    let process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap();
    let mut state = process.watch_state();
    let events = drain(process).await;

    let events: Vec<CliEvent> = events.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        events,
        vec![
            CliEvent::Delta("Hello".into()),
            CliEvent::Delta("\nworld".into()),
            CliEvent::Finished(Usage::new(12, 5)),
        ]
    );
    state.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(*state.borrow(), InvocationState::Succeeded);

    assert_eq!(fake.prompt(), "What is 2+2?");
    let args = fake.args();
    assert_eq!(
        args,
        vec![
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--model",
            "sonnet",
            "--append-system-prompt",
            "Be terse",
            "--resume",
            "conv-42",
        ]
    );
}

#[tokio::test]
async fn test_large_prompt_goes_through_stdin() {
    let fake = FakeCli::new(SUCCESS);
    // Well past the typical single-argument limit.
    let prompt = "x".repeat(4 * 1024 * 1024);
    let desc = InvocationDescriptor::new(prompt.clone(), ModelAlias::Opus);

    let process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap();
    let events = drain(process).await;

    assert!(matches!(events.last(), Some(Ok(CliEvent::Finished(_)))));
    assert_eq!(fake.prompt().len(), prompt.len());
    assert!(fake.args().iter().all(|a| a.len() < 64));
}

#[tokio::test]
async fn test_non_zero_exit_fails_after_partial_output() {
    let fake = FakeCli::new(FAILS_MIDWAY);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Haiku);

    let process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap();
    let mut state = process.watch_state();
    let events = drain(process).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_ref().unwrap(), &CliEvent::Delta("partial".into()));
    match &events[1] {
        Err(BridgeError::CliFailed { code, stderr }) => {
            assert_eq!(*code, Some(3));
            assert!(stderr.contains("fatal: model overloaded"));
        }
        other => panic!("unexpected {other:?}"),
    }
    state.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(*state.borrow(), InvocationState::Failed);
}

#[tokio::test]
async fn test_error_result_with_zero_exit_is_a_failure() {
    let fake = FakeCli::new(ERROR_RESULT);
    let mut desc = InvocationDescriptor::new("hi", ModelAlias::Opus);
    desc.session_id = Some("nope".into());

    let events = drain(CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap()).await;

    match events.as_slice() {
        [Err(BridgeError::CliFailed { stderr, .. })] => {
            assert!(stderr.contains("No conversation found"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let fake = FakeCli::new(HANGS);
    let mut config = fake.config();
    config.timeout = Duration::from_secs(1);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    let process = CliProcess::spawn(&fake.binary(), desc, &config, None).unwrap();
    let mut state = process.watch_state();
    let events = drain(process).await;

    assert!(events.len() <= 2);
    match events.last() {
        Some(Err(BridgeError::Timeout(after))) => assert_eq!(*after, Duration::from_secs(1)),
        other => panic!("unexpected {other:?}"),
    }
    state.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(*state.borrow(), InvocationState::TimedOut);
}

#[tokio::test]
async fn test_dropping_the_stream_kills_process() {
    let fake = FakeCli::new(HANGS);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    let mut process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap();
    let mut state = process.watch_state();
    assert!(matches!(process.next().await, Some(Ok(CliEvent::Delta(_)))));
    assert_eq!(process.state(), InvocationState::Running);
    drop(process);

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_terminal()))
        .await
        .expect("process was not killed")
        .unwrap();
    assert_eq!(*state.borrow(), InvocationState::Killed);
}

#[tokio::test]
async fn test_admission_permit_released_on_exit() {
    let fake = FakeCli::new(SUCCESS);
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
    let permit = semaphore.clone().try_acquire_owned().unwrap();
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    let process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), Some(permit)).unwrap();
    assert_eq!(semaphore.available_permits(), 0);
    drain(process).await;

    let permit = tokio::time::timeout(Duration::from_secs(5), semaphore.acquire())
        .await
        .expect("permit was not released");
    assert!(permit.is_ok());
}

#[tokio::test]
async fn test_invalid_utf8_stdout_line_is_skipped() {
    let fake = FakeCli::new(GARBLED_STDOUT);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    let events = drain(CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap()).await;

    let events: Vec<CliEvent> = events.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        events,
        vec![
            CliEvent::Delta("after".into()),
            CliEvent::Finished(Usage::new(3, 1)),
        ]
    );
}

#[tokio::test]
async fn test_invalid_utf8_stderr_keeps_pipe_drained() {
    let fake = FakeCli::new(NOISY_STDERR);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    let process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap();
    let mut state = process.watch_state();
    let events = drain(process).await;

    let events: Vec<CliEvent> = events.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        events,
        vec![
            CliEvent::Delta("fine".into()),
            CliEvent::Finished(Usage::new(2, 1)),
        ]
    );
    state.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(*state.borrow(), InvocationState::Succeeded);
}

#[tokio::test]
async fn test_clean_exit_without_result_is_truncated() {
    let fake = FakeCli::new(SILENT_EXIT);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    let process = CliProcess::spawn(&fake.binary(), desc, &fake.config(), None).unwrap();
    let mut state = process.watch_state();
    let events = drain(process).await;

    assert!(matches!(events.as_slice(), [Err(BridgeError::Truncated)]));
    state.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(*state.borrow(), InvocationState::Failed);
}

#[tokio::test]
async fn test_timeout_fires_while_consumer_is_stalled() {
    let fake = FakeCli::new(FLOODS_THEN_HANGS);
    let mut config = fake.config();
    config.timeout = Duration::from_secs(1);
    let desc = InvocationDescriptor::new("hi", ModelAlias::Opus);

    // Never polled until the deadline has passed.
    let process = CliProcess::spawn(&fake.binary(), desc, &config, None).unwrap();
    let mut state = process.watch_state();

    tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| s.is_terminal()))
        .await
        .expect("deadline was not enforced")
        .unwrap();
    assert_eq!(*state.borrow(), InvocationState::TimedOut);

    let events = drain(process).await;
    assert!(matches!(events.last(), Some(Err(BridgeError::Timeout(_)))));
}

#[test]
fn test_non_executable_file_is_unavailable() {
    let fake = FakeCli::new(SUCCESS);
    let path = fake.dir.join("scenario.sh");
    let err = CliBinary::resolve(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, BridgeError::CliUnavailable(_)));
}
