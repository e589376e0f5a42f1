//! 结构体绑定集成测试
//!
//! 通过配置环境绑定结构体，覆盖占位符、默认值、嵌套结构、map 以及配置变更自动更新

use envkit::config::{
    Bindable, Env, Environment, FieldTable, MapPropertySource, PropertySource, RunInfo,
    StandardEnvironment,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Default, Clone, PartialEq)]
struct Pool {
    size: u32,
    idle: Duration,
}

impl Bindable for Pool {
    fn describe(fields: &mut FieldTable<Self>) {
        fields.value("size", |p| &mut p.size).default("8");
        fields.value("idle", |p| &mut p.idle).key("idle-timeout").default("30s");
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct User {
    id: u64,
    username: String,
    timeout: u32,
    pool: Pool,
    replicas: HashMap<String, Pool>,
    weights: HashMap<String, f64>,
}

impl Bindable for User {
    fn describe(fields: &mut FieldTable<Self>) {
        fields.value("id", |u| &mut u.id);
        fields.value("username", |u| &mut u.username);
        fields.value("timeout", |u| &mut u.timeout).default("30");
        fields.nested("pool", |u| &mut u.pool);
        fields.map("replicas", |u| &mut u.replicas);
        fields.map_values("weights", |u| &mut u.weights);
    }
}

fn environment(dir: &TempDir, application: &str) -> Arc<StandardEnvironment> {
    std::fs::write(dir.path().join("application.properties"), application).unwrap();
    StandardEnvironment::builder()
        .config_dir_for_all(dir.path())
        .custom_run_info(RunInfo::new(Env::Test, "").with_work_dir(dir.path()))
        .system_environment(false)
        .args(Vec::<String>::new())
        .build()
        .unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_bind_with_placeholder_and_defaults() {
    let dir = TempDir::new().unwrap();
    let environment = environment(&dir, "user.id=1\nuser.username=Hello_${user.id}\n");

    let bound = environment
        .bind_properties("user", User::default(), false)
        .unwrap();
    let user = bound.get();

    assert_eq!(user.id, 1);
    assert_eq!(user.username, "Hello_1");
    assert_eq!(user.timeout, 30);
    assert_eq!(user.pool.size, 8);
    assert_eq!(user.pool.idle, Duration::from_secs(30));
    assert!(bound.first_error().is_none());

    let registered = environment.get_bound::<User>().unwrap();
    assert_eq!(registered.get(), user);
}

#[test]
fn test_bind_nested_and_maps() {
    let dir = TempDir::new().unwrap();
    let environment = environment(
        &dir,
        "db.pool.size=16\n\
         db.pool.idle-timeout=2m\n\
         db.replicas.r1.size=4\n\
         db.replicas.r2.idle-timeout=10s\n\
         db.weights.r1=0.75\n\
         db.weights.r2=0.25\n",
    );

    let user = environment
        .bind_properties("db", User::default(), false)
        .unwrap()
        .get();

    assert_eq!(user.pool.size, 16);
    assert_eq!(user.pool.idle, Duration::from_secs(120));
    assert_eq!(user.replicas.len(), 2);
    assert_eq!(user.replicas["r1"].size, 4);
    assert_eq!(user.replicas["r2"].size, 8);
    assert_eq!(user.replicas["r2"].idle, Duration::from_secs(10));
    assert_eq!(user.weights["r1"], 0.75);
    assert_eq!(user.weights["r2"], 0.25);
}

#[test]
fn test_conversion_error_reported_without_aborting() {
    let dir = TempDir::new().unwrap();
    let environment = environment(&dir, "user.id=abc\nuser.username=bob\n");

    let bound = environment
        .bind_properties("user", User::default(), false)
        .unwrap();

    assert_eq!(bound.read().username, "bob");
    assert_eq!(bound.read().id, 0);
    let err = bound.first_error().unwrap();
    assert_eq!(err.field, "id");
    assert_eq!(err.value, "abc");
}

#[test]
fn test_live_update_and_reset_to_default_on_delete() {
    let dir = TempDir::new().unwrap();
    let environment = environment(&dir, "user.id=1\nuser.username=Hello_${user.id}\n");

    let remote = Arc::new(MapPropertySource::empty("remote"));
    environment
        .property_sources()
        .add_first(Arc::clone(&remote) as Arc<dyn PropertySource>);

    let bound = environment
        .bind_properties("user", User::default(), true)
        .unwrap();
    assert_eq!(bound.read().timeout, 30);

    remote.put("user.timeout", "60");
    assert!(wait_until(|| bound.read().timeout == 60));

    remote.remove(["user.timeout"]);
    assert!(wait_until(|| bound.read().timeout == 30));

    remote.put("user.pool.size", "32");
    assert!(wait_until(|| bound.read().pool.size == 32));

    remote.put("user.replicas.r9.size", "2");
    assert!(wait_until(|| bound
        .read()
        .replicas
        .get("r9")
        .is_some_and(|pool| pool.size == 2)));

    assert_eq!(bound.read().username, "Hello_1");
}
