//! Event delivery from background jobs to the consumer

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{EventLog, ScriptedEngine, WAIT, test_config, wait_for_idle, wait_until};
use mediafetch::{ConfigUpdate, Event, EventRelay, EventType, MediaFetcher, TaskId};

#[test]
fn full_queue_rejects_the_1001st_publish() {
    let relay = EventRelay::new(1000);
    for i in 0..1000 {
        assert!(relay.publish(Event::progress(TaskId(i), 1.0)));
    }
    assert!(!relay.publish(Event::progress(TaskId(1000), 1.0)));
    assert_eq!(relay.dropped_count(), 1);

    // Room frees up once the consumer drains
    assert_eq!(relay.drain(10), 10);
    assert!(relay.publish(Event::progress(TaskId(1001), 1.0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_task_events_arrive_in_publish_order() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fetcher = MediaFetcher::new(test_config(&temp_dir, 3), Arc::new(ScriptedEngine::new()))
        .await
        .unwrap();
    let log = EventLog::attach(&fetcher);
    fetcher.start();

    let ids: Vec<_> = (0..3)
        .map(|i| fetcher.submit(format!("https://media.example.com/o/{i}")).unwrap().id)
        .collect();
    assert!(wait_for_idle(&fetcher).await);
    assert!(wait_until(WAIT, || log.count(EventType::Complete) == 3).await);

    for id in ids {
        let events = log.for_task(id);
        let progress: Vec<f64> = events
            .iter()
            .filter(|e| e.event_type() == EventType::Progress)
            .map(|e| e.get("progress").and_then(|v| v.as_f64()).unwrap())
            .collect();

        assert_eq!(progress.len(), 20, "one PROGRESS per 5-point bucket");
        assert!(progress.windows(2).all(|w| w[0] < w[1]), "out of order: {progress:?}");

        let terminal: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == EventType::Complete)
            .collect();
        assert_eq!(terminal.len(), 1, "exactly one terminal event");
        assert_eq!(
            events.last().map(|e| e.event_type()),
            Some(EventType::Complete)
        );
    }

    fetcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn complete_event_carries_title_and_path() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fetcher = MediaFetcher::new(test_config(&temp_dir, 1), Arc::new(ScriptedEngine::new()))
        .await
        .unwrap();
    let log = EventLog::attach(&fetcher);
    fetcher.start();

    let task = fetcher.submit("https://media.example.com/v/clip").unwrap();
    assert!(wait_until(WAIT, || log.count(EventType::Complete) == 1).await);

    let complete = &log.of_type(EventType::Complete)[0];
    assert_eq!(complete.task_id(), Some(task.id));
    assert_eq!(complete.get("title").and_then(|v| v.as_str()), Some("clip"));
    let expected = temp_dir.path().join("downloads").join("clip.bin");
    assert_eq!(
        complete.get("path").and_then(|v| v.as_str()),
        Some(expected.display().to_string().as_str())
    );
    assert_eq!(fetcher.get(task.id).unwrap().output_path, Some(expected));

    fetcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_can_drain_manually() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp_dir, 1);
    config.events.auto_drain = false;
    config.events.max_batch = 2;
    let fetcher = MediaFetcher::new(config, Arc::new(ScriptedEngine::new()))
        .await
        .unwrap();
    let log = EventLog::attach(&fetcher);
    fetcher.start();

    for i in 0..3 {
        fetcher
            .submit(format!("https://media.example.com/m/{i}"))
            .unwrap();
    }
    assert!(wait_for_idle(&fetcher).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.events().is_empty(), "nothing is delivered without a drain");

    assert_eq!(fetcher.drain_events(), 2, "one batch per drain");
    assert_eq!(log.events().len(), 2);

    while fetcher.drain_events() > 0 {}
    assert_eq!(log.count(EventType::Complete), 3);
    assert_eq!(log.count(EventType::RegistryChanged), 3);

    fetcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_handlers_do_not_starve_others() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fetcher = MediaFetcher::new(test_config(&temp_dir, 1), Arc::new(ScriptedEngine::new()))
        .await
        .unwrap();

    fetcher.subscribe(EventType::Complete, |_| Err("consumer rejected event".into()));
    fetcher.subscribe(EventType::Complete, |_| panic!("consumer crashed"));
    let healthy = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&healthy);
    fetcher.subscribe(EventType::Complete, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    fetcher.start();

    fetcher.submit("https://media.example.com/h/1").unwrap();
    fetcher.submit("https://media.example.com/h/2").unwrap();

    assert!(wait_until(WAIT, || healthy.load(Ordering::SeqCst) == 2).await);
    fetcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_changes_and_registry_changes_are_published() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fetcher = MediaFetcher::new(test_config(&temp_dir, 1), Arc::new(ScriptedEngine::new()))
        .await
        .unwrap();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    fetcher.subscribe(EventType::RegistryChanged, move |event| {
        let reason = event.get("reason").and_then(|v| v.as_str()).unwrap_or_default();
        sink.lock().unwrap().push(reason.to_string());
        Ok(())
    });
    let log = EventLog::attach(&fetcher);

    let task = fetcher.submit("https://media.example.com/r/1").unwrap();
    fetcher.remove(task.id);
    fetcher.submit("https://media.example.com/r/2").unwrap();
    fetcher.clear();
    fetcher
        .update_config(ConfigUpdate {
            progress_step: Some(25.0),
            ..Default::default()
        })
        .unwrap();

    while fetcher.drain_events() > 0 {}
    assert_eq!(
        *reasons.lock().unwrap(),
        vec!["submit", "remove", "submit", "clear"]
    );
    let changed = log.of_type(EventType::ConfigChanged);
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].get("value").and_then(|v| v.as_f64()), Some(25.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_remaining_events() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp_dir, 1);
    config.events.auto_drain = false;
    let fetcher = MediaFetcher::new(config, Arc::new(ScriptedEngine::new()))
        .await
        .unwrap();
    let log = EventLog::attach(&fetcher);

    fetcher.submit("https://media.example.com/f/1").unwrap();
    assert!(log.events().is_empty());

    fetcher.shutdown().await.unwrap();
    assert_eq!(log.count(EventType::RegistryChanged), 1);
    assert!(!fetcher.relay().publish(Event::new(EventType::Progress)));
}
