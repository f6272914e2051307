mod common;

use async_trait::async_trait;
use common::{
    mock_server_script, script_config, slow_handshake_script, supervisor, supervisor_with,
    test_settings, write_script,
};
use mcp_gateway::config::{ConfigStore, MemoryConfigStore, ServerConfig};
use mcp_gateway::context::GatewayContext;
use mcp_gateway::error::{Error, Result};
use mcp_gateway::server::{
    InstanceState, ProcessSupervisor, ServerLifecycleEvent, ServerState, StopOutcome,
};
use mockall::mock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

mock! {
    pub Store {}

    #[async_trait]
    impl ConfigStore for Store {
        async fn load_servers(&self) -> Result<Vec<ServerConfig>>;
        async fn load_server(&self, id: &str) -> Result<Option<ServerConfig>>;
        async fn save_server(&self, config: &ServerConfig) -> Result<()>;
        async fn load_instances(&self) -> Result<Vec<InstanceState>>;
        async fn save_instance(&self, state: &InstanceState) -> Result<()>;
    }
}

#[tokio::test]
async fn test_start_and_stop() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let supervisor = supervisor();

    assert!(supervisor.start("mock", Some(script_config("mock", &script))).await?);

    let state = supervisor.status("mock").unwrap();
    assert_eq!(state.state, ServerState::Running);
    assert!(state.pid.is_some());
    assert!(state.start_time.is_some());
    assert_eq!(supervisor.running_count(), 1);

    let outcome = supervisor.stop("mock", false).await?;
    assert!(matches!(outcome, StopOutcome::Stopped { .. }));

    let state = supervisor.status("mock").unwrap();
    assert_eq!(state.state, ServerState::Stopped);
    assert_eq!(state.pid, None);
    assert!(state.stop_time.is_some());
    assert_eq!(supervisor.running_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stop_distinguishes_unknown_from_stopped() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let supervisor = supervisor();

    let never_started = supervisor.stop("ghost", false).await?;
    assert_eq!(never_started, StopOutcome::NotFound);
    assert!(!never_started.as_bool());

    supervisor.start("mock", Some(script_config("mock", &script))).await?;
    supervisor.stop("mock", true).await?;

    let already_stopped = supervisor.stop("mock", false).await?;
    assert_eq!(already_stopped, StopOutcome::AlreadyStopped);
    assert!(already_stopped.as_bool());
    Ok(())
}

#[tokio::test]
async fn test_second_start_is_rejected() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let supervisor = supervisor();
    let config = script_config("mock", &script);

    supervisor.start("mock", Some(config.clone())).await?;
    let second = supervisor.start("mock", Some(config)).await;

    assert!(matches!(second, Err(Error::AlreadyRunning(_))));
    supervisor.stop("mock", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_marks_failed() -> Result<()> {
    let supervisor = supervisor();
    let config = ServerConfig::new("ghost", "/nonexistent/mcp-server", vec![]);

    let started = supervisor.start("ghost", Some(config)).await?;

    assert!(!started);
    let state = supervisor.status("ghost").unwrap();
    assert_eq!(state.state, ServerState::Failed);
    assert!(state.last_error.unwrap().contains("spawn"));

    let events = supervisor.context().journal.get_server_events("ghost", None)?;
    assert_eq!(events[0].event, ServerLifecycleEvent::Failed);
    Ok(())
}

#[tokio::test]
async fn test_handshake_failure_marks_failed_with_reason() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exit.sh", "echo 'no api key' >&2\nexit 3\n");
    let supervisor = supervisor();

    let started = supervisor.start("broken", Some(script_config("broken", &script))).await?;

    assert!(!started);
    let state = supervisor.status("broken").unwrap();
    assert_eq!(state.state, ServerState::Failed);
    let error = state.last_error.unwrap();
    assert!(error.contains("code 3"), "{}", error);
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_spawn() {
    let supervisor = supervisor();
    let config = ServerConfig::new("bad id", "cat", vec![]);

    let result = supervisor.start("bad id", Some(config)).await;

    assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    assert!(supervisor.status("bad id").is_none());
}

#[tokio::test]
async fn test_start_without_config_uses_store() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("stored", &script)).await?;
    let supervisor = supervisor_with(store);

    assert!(supervisor.start("stored", None).await?);
    assert!(matches!(
        supervisor.start("missing", None).await,
        Err(Error::ServerNotFound(_))
    ));

    supervisor.stop("stored", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_is_atomic() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "slow.sh", &slow_handshake_script(0.5));
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("slow", &script)).await?;
    let supervisor = supervisor_with(store);

    assert!(supervisor.start("slow", None).await?);

    let restarting = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.restart("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        supervisor.stop("slow", true).await,
        Err(Error::OperationInProgress(_))
    ));
    assert!(matches!(
        supervisor.start("slow", None).await,
        Err(Error::OperationInProgress(_))
    ));
    assert!(matches!(
        supervisor.restart("slow").await,
        Err(Error::OperationInProgress(_))
    ));

    assert!(restarting.await.unwrap()?);
    assert_eq!(supervisor.status("slow").unwrap().state, ServerState::Running);

    supervisor.stop("slow", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_manual_restart_resets_restart_count() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("mock", &script)).await?;
    let supervisor = supervisor_with(store);

    supervisor.start("mock", None).await?;
    let bridge = supervisor.bridge("mock").await?;
    supervisor
        .mark("mock", ServerState::Crashed, Some("simulated".to_string()), Some(&bridge))
        .await?;
    assert!(supervisor.recover("mock", Duration::ZERO, None).await?);

    assert_eq!(supervisor.status("mock").unwrap().restart_count, 1);
    assert_eq!(supervisor.context().restarts.history_len("mock"), 1);

    assert!(supervisor.restart("mock").await?);
    assert_eq!(supervisor.status("mock").unwrap().restart_count, 0);
    assert_eq!(supervisor.context().restarts.history_len("mock"), 0);

    supervisor.stop("mock", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_automatic_start_lands_in_crashed() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("flaky", &script)).await?;
    let supervisor = supervisor_with(store);

    supervisor.start("flaky", None).await?;
    let bridge = supervisor.bridge("flaky").await?;
    supervisor
        .mark("flaky", ServerState::Crashed, Some("simulated".to_string()), Some(&bridge))
        .await?;

    // The script disappears, so the restart cannot handshake
    std::fs::remove_file(&script).unwrap();
    assert!(!supervisor.recover("flaky", Duration::ZERO, None).await?);

    let state = supervisor.status("flaky").unwrap();
    assert_eq!(state.state, ServerState::Crashed);
    assert_eq!(state.restart_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_recover_leaves_a_live_server_alone() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let supervisor = supervisor();
    supervisor.start("mock", Some(script_config("mock", &script))).await?;
    let bridge = supervisor.bridge("mock").await?;
    let pid = bridge.pid();

    let result = supervisor.recover("mock", Duration::ZERO, Some(&bridge)).await;

    assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    let state = supervisor.status("mock").unwrap();
    assert_eq!(state.state, ServerState::Running);
    assert_eq!(state.pid, Some(pid));
    assert_eq!(state.restart_count, 0);
    assert!(bridge.is_alive());
    assert_eq!(supervisor.running_count(), 1);
    assert_eq!(supervisor.bridge("mock").await?.pid(), pid);

    supervisor.stop("mock", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_verdicts_on_a_replaced_process_are_rejected() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("mock", &script)).await?;
    let supervisor = supervisor_with(store);

    supervisor.start("mock", None).await?;
    let stale = supervisor.bridge("mock").await?;
    assert!(supervisor.restart("mock").await?);
    let fresh = supervisor.bridge("mock").await?;
    assert!(!stale.is_alive());

    let marked = supervisor
        .mark("mock", ServerState::Crashed, Some("stale".to_string()), Some(&stale))
        .await;
    assert!(matches!(marked, Err(Error::ProcessReplaced(_))));

    let recovered = supervisor.recover("mock", Duration::ZERO, Some(&stale)).await;
    assert!(matches!(recovered, Err(Error::ProcessReplaced(_))));

    let state = supervisor.status("mock").unwrap();
    assert_eq!(state.state, ServerState::Running);
    assert_eq!(state.pid, Some(fresh.pid()));
    assert_eq!(state.restart_count, 0);
    assert!(fresh.is_alive());
    assert_eq!(supervisor.running_count(), 1);

    supervisor.stop("mock", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_second_recovery_of_the_same_crash_is_a_no_op() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("mock", &script)).await?;
    let supervisor = supervisor_with(store);

    supervisor.start("mock", None).await?;
    let crashed = supervisor.bridge("mock").await?;
    supervisor
        .mark("mock", ServerState::Crashed, None, Some(&crashed))
        .await?;
    assert!(supervisor.recover("mock", Duration::ZERO, None).await?);
    let pid = supervisor.status("mock").unwrap().pid;

    // A second observer of the same crash arrives late
    let late = supervisor.recover("mock", Duration::ZERO, None).await;

    assert!(matches!(late, Err(Error::ProcessReplaced(_))));
    let state = supervisor.status("mock").unwrap();
    assert_eq!(state.restart_count, 1);
    assert_eq!(state.pid, pid);
    assert!(supervisor.bridge("mock").await?.is_alive());

    supervisor.stop("mock", true).await?;
    Ok(())
}

#[tokio::test]
async fn test_start_all_skips_disabled_and_reports_failures() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let store = MemoryConfigStore::new();
    store.save_server(&script_config("good", &script)).await?;
    store
        .save_server(&ServerConfig::new("bad", "/nonexistent/mcp-server", vec![]))
        .await?;
    let mut disabled = script_config("off", &script);
    disabled.enabled = false;
    store.save_server(&disabled).await?;
    let supervisor = supervisor_with(store);

    let mut results = supervisor.start_all().await?;
    results.sort();

    assert_eq!(
        results,
        vec![("bad".to_string(), false), ("good".to_string(), true)]
    );

    let statuses = supervisor.statuses().await?;
    let off = statuses.iter().find(|s| s.server_id == "off").unwrap();
    assert_eq!(off.state, ServerState::Stopped);

    let stopped = supervisor.stop_all().await;
    assert_eq!(stopped, vec![("good".to_string(), true)]);
    Ok(())
}

#[tokio::test]
async fn test_bridge_lookup_errors() -> Result<()> {
    let store = MemoryConfigStore::new();
    store.save_server(&ServerConfig::new("idle", "cat", vec![])).await?;
    let supervisor = supervisor_with(store);

    assert!(matches!(supervisor.bridge("idle").await, Err(Error::NotRunning(_))));
    assert!(matches!(supervisor.bridge("nope").await, Err(Error::ServerNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_instance_state_is_persisted() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());

    let saved: Arc<Mutex<Vec<ServerState>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&saved);

    let mut store = MockStore::new();
    store.expect_save_instance().returning(move |state| {
        recorder.lock().unwrap().push(state.state);
        Ok(())
    });

    let ctx = GatewayContext::new(test_settings(), Arc::new(store))?;
    let supervisor = ProcessSupervisor::new(ctx);

    supervisor.start("mock", Some(script_config("mock", &script))).await?;
    supervisor.stop("mock", false).await?;

    assert_eq!(
        *saved.lock().unwrap(),
        vec![ServerState::Starting, ServerState::Running, ServerState::Stopped]
    );
    Ok(())
}

#[tokio::test]
async fn test_persistence_failure_does_not_fail_start() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());

    let mut store = MockStore::new();
    store
        .expect_save_instance()
        .returning(|_| Err(Error::Storage("disk full".to_string())));

    let ctx = GatewayContext::new(test_settings(), Arc::new(store))?;
    let supervisor = ProcessSupervisor::new(ctx);

    assert!(supervisor.start("mock", Some(script_config("mock", &script))).await?);
    supervisor.stop("mock", true).await?;
    Ok(())
}
