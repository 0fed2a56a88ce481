//! End-to-end scenarios against real (shell-script) stdio children, driving
//! the proxy the way a client actually would: through `Application` and
//! `ProxyRouter`, never by poking internal state directly.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use mcphub_core::TagFilter;
use mcphub_hub::{Application, ChangeAction};
use serde_json::{Map, Value, json};

/// Writes a minimal line-delimited-JSON-RPC stdio MCP server that exposes a
/// single tool named `tool_name` and always replies `reply_text` to
/// `tools/call`.
fn write_mock_server(dir: &Path, script_name: &str, tool_name: &str, reply_text: &str) -> std::path::PathBuf {
    let path = dir.join(script_name);
    fs::write(
        &path,
        format!(
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"{tool}","description":"mock","inputSchema":{{"type":"object","properties":{{}}}}}}]}}}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"{reply}"}}]}}}}\n' "$id"
      ;;
  esac
done
"#,
            tool = tool_name,
            reply = reply_text,
        ),
    )
    .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    path
}

/// Builds one `mcpServers` entry as a JSON object (not a string splice), so
/// `write_config` just assembles a real `serde_json::Value` tree.
fn child_entry(script: &Path, tags: &[&str]) -> Value {
    json!({
        "type": "stdio",
        "command": "sh",
        "args": [script.to_string_lossy()],
        "tags": tags,
    })
}

fn write_config(dir: &Path, servers: Vec<(&str, Value)>) -> std::path::PathBuf {
    let mut map = Map::new();
    for (name, entry) in servers {
        map.insert(name.to_string(), entry);
    }
    let path = dir.join("mcphub.json");
    let text = json!({ "mcpServers": Value::Object(map) }).to_string();
    fs::write(&path, text).unwrap();
    path
}

/// Scenario 1: two static stdio children, one tool each. `tools/list` shows
/// both namespaced tools; each `tools/call` reaches the right child.
#[tokio::test]
async fn two_children_each_expose_one_tool() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_mock_server(dir.path(), "a.sh", "ping", "A");
    let b = write_mock_server(dir.path(), "b.sh", "pong", "B");
    let config_path = write_config(dir.path(), vec![("A", child_entry(&a, &[])), ("B", child_entry(&b, &[]))]);

    let app = Application::bootstrap(config_path).await.unwrap();
    app.orchestrator.wait_for_minimum_servers().await;

    let listed = app.router.list_tools_internal().await.unwrap();
    let mut names: Vec<_> = listed.tools.iter().map(|t| t.name.to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["A.ping".to_string(), "B.pong".to_string()]);

    let ping = app
        .router
        .call_tool_internal(rmcp::model::CallToolRequestParam { name: "A.ping".into(), arguments: None })
        .await
        .unwrap();
    assert_eq!(ping.content[0].as_text().map(|t| t.text.as_str()), Some("A"));

    let pong = app
        .router
        .call_tool_internal(rmcp::model::CallToolRequestParam { name: "B.pong".into(), arguments: None })
        .await
        .unwrap();
    assert_eq!(pong.content[0].as_text().map(|t| t.text.as_str()), Some("B"));

    app.shutdown().await;
}

/// Scenario 2: a session's tag filter narrows which children's tools are
/// visible, without needing either child to restart.
#[tokio::test]
async fn tag_filter_narrows_visible_children() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_mock_server(dir.path(), "a.sh", "web_tool", "A");
    let b = write_mock_server(dir.path(), "b.sh", "db_tool", "B");
    let config_path = write_config(
        dir.path(),
        vec![("A", child_entry(&a, &["web"])), ("B", child_entry(&b, &["db"]))],
    );

    let app = Application::bootstrap(config_path).await.unwrap();
    app.orchestrator.wait_for_minimum_servers().await;

    let web_only = app.router.with_tag_filter(TagFilter::parse_simple("web"));
    let listed = web_only.list_tools_internal().await.unwrap();
    let names: Vec<_> = listed.tools.iter().map(|t| t.name.to_string()).collect();
    assert_eq!(names, vec!["A.web_tool".to_string()]);

    let both = app.router.with_tag_filter(TagFilter::parse_simple("web OR db"));
    let listed = both.list_tools_internal().await.unwrap();
    let mut names: Vec<_> = listed.tools.iter().map(|t| t.name.to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["A.web_tool".to_string(), "B.db_tool".to_string()]);

    app.shutdown().await;
}

/// Scenario 3: a tags-only config rewrite is applied without restarting the
/// child — the live connection (and hence the underlying process) never
/// changes identity.
#[tokio::test]
async fn metadata_only_reload_does_not_restart_child() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_mock_server(dir.path(), "a.sh", "ping", "A");
    let config_path = write_config(dir.path(), vec![("A", child_entry(&a, &["web"]))]);

    let app = Application::bootstrap(config_path.clone()).await.unwrap();
    app.orchestrator.wait_for_minimum_servers().await;

    let before = app.resolver.find_by_server_name("A").await.unwrap();

    write_config(dir.path(), vec![("A", child_entry(&a, &["web", "api"]))]);
    let diff = app.config_manager.reload().await.unwrap();
    match diff.actions.get("A") {
        Some(ChangeAction::MetadataOnly { fields }) => assert!(fields.contains(&"tags".to_string())),
        other => panic!("expected a metadata-only change for A, got {other:?}"),
    }

    let current = app.config_manager.snapshot().await;
    app.resolver.register_metadata_only(current.get("A").unwrap().clone()).await;

    let after = app.resolver.find_by_server_name("A").await.unwrap();
    assert!(Arc::ptr_eq(&before, &after), "metadata-only reload must not replace the live connection");

    let config = app.resolver.config_for("A").await.unwrap();
    assert!(config.tags.contains(&"api".to_string()));

    app.shutdown().await;
}

/// Scenario 4: changing a child's command is a connection-affecting change
/// and must be classified as a restart, not metadata-only.
#[tokio::test]
async fn functional_change_is_classified_as_restart() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_mock_server(dir.path(), "a.sh", "ping", "A");
    let a2 = write_mock_server(dir.path(), "a2.sh", "ping", "A2");
    let config_path = write_config(dir.path(), vec![("A", child_entry(&a, &[]))]);

    let app = Application::bootstrap(config_path.clone()).await.unwrap();
    app.orchestrator.wait_for_minimum_servers().await;

    write_config(dir.path(), vec![("A", child_entry(&a2, &[]))]);
    let diff = app.config_manager.reload().await.unwrap();
    match diff.actions.get("A") {
        Some(ChangeAction::Restart { fields }) => assert!(fields.contains(&"transport".to_string())),
        other => panic!("expected a restart for A, got {other:?}"),
    }

    app.shutdown().await;
}

/// Scenario 5: concurrent `tools/list` calls against a cold schema cache
/// coalesce into loading the schema once; every caller still gets the
/// result.
#[tokio::test]
async fn concurrent_tool_listings_coalesce_the_cache_miss() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_mock_server(dir.path(), "a.sh", "foo", "A");
    let config_path = write_config(dir.path(), vec![("A", child_entry(&a, &[]))]);

    let app = Application::bootstrap(config_path).await.unwrap();
    app.orchestrator.wait_for_minimum_servers().await;

    let router = app.router.clone();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let router = router.clone();
        handles.push(tokio::spawn(async move { router.list_tools_internal().await.unwrap() }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name.as_ref(), "A.foo");
    }

    app.shutdown().await;
}

/// Scenario 6: a session created before a proxy restart can be restored
/// afterwards (same storage dir) once its `initializeResponse` was saved,
/// without the client being asked to re-initialize.
#[tokio::test]
async fn session_survives_across_session_manager_restart() {
    let store_root = tempfile::tempdir().unwrap();

    let store = Arc::new(
        mcphub_hub::PersistentStore::open(store_root.path().to_path_buf(), "session:")
            .await
            .unwrap(),
    );
    let manager = mcphub_hub::SessionManager::new(store);
    let session = manager.create_session(Some("web".to_string())).await;
    manager
        .record_initialize_response(&session.record.id, json!({"protocolVersion": "2024-11-05"}))
        .await;

    // Simulate a restart: a brand-new `SessionManager` over the same store root.
    let store_after = Arc::new(
        mcphub_hub::PersistentStore::open(store_root.path().to_path_buf(), "session:")
            .await
            .unwrap(),
    );
    let manager_after = mcphub_hub::SessionManager::new(store_after);
    let restored = manager_after.restore_session(&session.record.id).await.unwrap();

    assert_eq!(restored.record.id, session.record.id);
    assert!(restored.record.initialize_response.is_some());
}
