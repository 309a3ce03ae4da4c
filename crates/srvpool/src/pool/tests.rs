use super::*;
use crate::Server;
use async_trait::async_trait;
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::time::Instant;

type Handler = &'static str;

/// Tracks how many mock operations run at the same time.
#[derive(Default)]
struct Probe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Probe {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockServer {
    name: Mutex<String>,
    bind: String,
    expose: String,
    running: AtomicBool,
    accept_merge: bool,
    fail_listen: bool,
    delay: Duration,
    handler: Mutex<Option<Handler>>,
    listens: AtomicUsize,
    restarts: AtomicUsize,
    shutdowns: AtomicUsize,
    merges: AtomicUsize,
    probe: Arc<Probe>,
}

impl MockServer {
    fn new(name: &str, bind: &str) -> Self {
        Self {
            name: Mutex::new(name.to_string()),
            bind: bind.to_string(),
            expose: format!("public.example.com{bind}"),
            running: AtomicBool::new(false),
            accept_merge: true,
            fail_listen: false,
            delay: Duration::ZERO,
            handler: Mutex::new(None),
            listens: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            merges: AtomicUsize::new(0),
            probe: Arc::new(Probe::default()),
        }
    }

    fn refusing_merge(mut self) -> Self {
        self.accept_merge = false;
        self
    }

    fn failing_listen(mut self) -> Self {
        self.fail_listen = true;
        self
    }

    fn running(self) -> Self {
        self.running.store(true, Ordering::SeqCst);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_probe(mut self, probe: &Arc<Probe>) -> Self {
        self.probe = Arc::clone(probe);
        self
    }

    fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn work(&self) {
        self.probe.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.probe.exit();
    }
}

#[async_trait]
impl Server<Handler> for MockServer {
    fn bindable(&self) -> String {
        self.bind.clone()
    }

    fn expose(&self) -> String {
        self.expose.clone()
    }

    fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn listen(&self, handler: Handler) -> Result<()> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        if self.fail_listen {
            return Err(Error::Bind {
                bind: self.bind.clone(),
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        *self.handler.lock().unwrap() = Some(handler);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) {
        self.work().await;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    async fn shutdown(&self) {
        self.work().await;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn merge(&self, other: &dyn Server<Handler>) -> bool {
        if !self.accept_merge {
            return false;
        }
        self.merges.fetch_add(1, Ordering::SeqCst);
        *self.name.lock().unwrap() = other.name();
        true
    }
}

fn shared(server: &Arc<MockServer>) -> SharedServer<Handler> {
    Arc::clone(server) as SharedServer<Handler>
}

fn same(a: &SharedServer<Handler>, b: &Arc<MockServer>) -> bool {
    core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

async fn pool_of(servers: &[&Arc<MockServer>]) -> Pool<Handler> {
    Pool::new(servers.iter().map(|s| shared(s))).await
}

fn fast_config() -> PoolConfig {
    PoolConfig::new()
        .with_restart_timeout(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn add_keeps_bind_addresses_unique() {
    let mut pool: Pool<Handler> = Pool::default();
    let rounds = [
        vec![("a", ":9001"), ("b", ":9002")],
        vec![("c", ":9001"), ("d", ":9003"), ("e", ":9002")],
        vec![("f", ":9003"), ("g", ":9003"), ("h", ":9004")],
    ];

    for (round, entries) in rounds.iter().enumerate() {
        let servers: Vec<SharedServer<Handler>> = entries
            .iter()
            .map(|(name, bind)| {
                let server = MockServer::new(name, bind);
                let server = if round % 2 == 0 {
                    server
                } else {
                    server.refusing_merge()
                };
                server.shared() as SharedServer<Handler>
            })
            .collect();
        pool = pool.add(servers).await.expect("add");

        let binds: Vec<String> = pool.iter().map(|s| s.bindable()).collect();
        let unique: HashSet<&String> = binds.iter().collect();
        assert_eq!(binds.len(), unique.len(), "duplicate bind in {binds:?}");
    }
    assert_eq!(pool.len(), 4);
}

#[tokio::test]
async fn successful_merge_keeps_original_instance() {
    let original = MockServer::new("api", ":9001").shared();
    let incoming = MockServer::new("api-v2", ":9001").shared();
    let pool = pool_of(&[&original]).await;

    let merged = pool.add([shared(&incoming)]).await.expect("add");

    assert_eq!(merged.len(), 1);
    let entry = merged.get(":9001").expect("present");
    assert!(same(&entry, &original));
    assert_eq!(original.merges.load(Ordering::SeqCst), 1);
    assert_eq!(entry.name(), "api-v2");
}

#[tokio::test]
async fn refused_merge_replaces_and_stops_old_instance() {
    let old = MockServer::new("api", ":9001").refusing_merge().running().shared();
    let new = MockServer::new("api", ":9001").shared();
    let pool = pool_of(&[&old]).await;

    let replaced = pool.add([shared(&new)]).await.expect("add");

    assert_eq!(replaced.len(), 1);
    assert!(same(&replaced.get(":9001").expect("present"), &new));
    assert!(!old.is_running());
    assert_eq!(old.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn add_with_empty_bind_touches_nothing() {
    let old = MockServer::new("api", ":9001").refusing_merge().running().shared();
    let pool = pool_of(&[&old]).await;
    let replacement = MockServer::new("api2", ":9001").shared();
    let nobind = MockServer::new("bad", "").shared();

    let res = pool.add([shared(&replacement), shared(&nobind)]).await;

    assert!(matches!(res, Err(Error::InvalidBindAddress(_))));
    assert!(same(&pool.get(":9001").expect("present"), &old));
    assert!(old.is_running());
    assert_eq!(old.shutdowns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn add_returns_a_new_pool_value() {
    let a = MockServer::new("a", ":9001").shared();
    let b = MockServer::new("b", ":9002").shared();
    let pool = pool_of(&[&a]).await;
    let before = pool.generation();

    let grown = pool.add([shared(&b)]).await.expect("add");

    assert_eq!(pool.len(), 1);
    assert!(!pool.has(":9002"));
    assert_eq!(grown.len(), 2);
    assert!(grown.generation() > before);
    assert_eq!(grown.config(), pool.config());
}

#[tokio::test]
async fn add_rejects_empty_bind_address() {
    let pool: Pool<Handler> = Pool::default();
    let res = pool.add([MockServer::new("nobind", " ").shared() as SharedServer<Handler>]).await;
    assert!(matches!(res, Err(Error::InvalidBindAddress(_))));

    let seeded = pool_of(&[
        &MockServer::new("nobind", "").shared(),
        &MockServer::new("ok", ":9001").shared(),
    ])
    .await;
    assert_eq!(seeded.len(), 1);
    assert!(seeded.has(":9001"));
}

#[tokio::test]
async fn del_stops_only_the_removed_member() {
    let a = MockServer::new("a", ":9001").running().shared();
    let b = MockServer::new("b", ":9002").running().shared();
    let pool = pool_of(&[&a, &b]).await;

    let reduced = pool.del(":9001").await;

    assert!(!reduced.has(":9001"));
    assert!(reduced.get(":9001").is_none());
    assert_eq!(reduced.len(), 1);
    assert!(!a.is_running());
    assert!(b.is_running());
    assert_eq!(b.shutdowns.load(Ordering::SeqCst), 0);
    // the original value still lists both
    assert_eq!(pool.len(), 2);
}

#[tokio::test]
async fn del_of_unknown_bind_is_a_noop() {
    let a = MockServer::new("a", ":9001").running().shared();
    let pool = pool_of(&[&a]).await;

    let same_pool = pool.del(":9999").await;

    assert_eq!(same_pool.len(), 1);
    assert_eq!(same_pool.generation(), pool.generation());
    assert!(a.is_running());
}

async fn named_pool() -> Pool<Handler> {
    pool_of(&[
        &MockServer::new("prod-api", ":9001").shared(),
        &MockServer::new("staging", ":9002").shared(),
        &MockServer::new("Prod-Admin", ":9003").shared(),
    ])
    .await
}

#[tokio::test]
async fn list_matches_lowercased_substring() {
    let pool = named_pool().await;

    let binds = pool.list(FieldKind::Name, FieldKind::BindAddress, "prod", "");
    assert_eq!(binds, vec![":9001".to_string(), ":9003".to_string()]);

    let names = pool.list(FieldKind::BindAddress, FieldKind::Name, ":9002", "");
    assert_eq!(names, vec!["staging".to_string()]);

    let exposed = pool.list(FieldKind::ExposedAddress, FieldKind::ExposedAddress, "PUBLIC", "");
    assert_eq!(exposed.len(), 3);
}

#[tokio::test]
async fn list_with_no_pattern_and_no_regex_is_empty() {
    let pool = named_pool().await;
    for field in FieldKind::ALL {
        assert!(pool.list(field, FieldKind::Name, "", "").is_empty());
    }
    assert!(pool.filter(FieldKind::Name, "", "").is_empty());
}

#[tokio::test]
async fn list_falls_back_to_regex_on_name() {
    let pool = named_pool().await;

    let only_regex = pool.list(FieldKind::BindAddress, FieldKind::Name, "", "^stag");
    assert_eq!(only_regex, vec!["staging".to_string()]);

    // pattern misses, regex still applies to the name
    let fallback = pool.list(FieldKind::BindAddress, FieldKind::BindAddress, "zzz", "api$");
    assert_eq!(fallback, vec![":9001".to_string()]);

    // regex is case-sensitive, unlike the substring pattern
    let case = pool.list(FieldKind::Name, FieldKind::Name, "", "^prod");
    assert_eq!(case, vec!["prod-api".to_string()]);
}

#[tokio::test]
async fn invalid_regex_is_a_non_match() {
    let pool = named_pool().await;

    assert!(pool.list(FieldKind::Name, FieldKind::Name, "", "(unclosed").is_empty());

    let with_pattern = pool.list(FieldKind::Name, FieldKind::BindAddress, "admin", "(unclosed");
    assert_eq!(with_pattern, vec![":9003".to_string()]);
}

#[tokio::test]
async fn filter_returns_shared_handles() {
    let prod = MockServer::new("prod-api", ":9001").shared();
    let staging = MockServer::new("staging", ":9002").shared();
    let pool = pool_of(&[&prod, &staging]).await;

    let sub = pool.filter(FieldKind::Name, "PROD", "");

    assert_eq!(sub.len(), 1);
    assert!(same(&sub.get(":9001").expect("present"), &prod));
    assert_eq!(sub.config(), pool.config());
}

#[tokio::test]
async fn is_running_semantics() {
    let empty: Pool<Handler> = Pool::default();
    assert!(!empty.is_running(true));
    assert!(!empty.is_running(false));

    let all = pool_of(&[
        &MockServer::new("a", ":9001").running().shared(),
        &MockServer::new("b", ":9002").running().shared(),
    ])
    .await;
    assert!(all.is_running(false));
    assert!(all.is_running(true));

    let one = pool_of(&[
        &MockServer::new("a", ":9001").shared(),
        &MockServer::new("b", ":9002").running().shared(),
        &MockServer::new("c", ":9003").shared(),
    ])
    .await;
    assert!(one.is_running(true));
    assert!(!one.is_running(false));
}

#[tokio::test]
async fn listen_attempts_every_member_and_aggregates_failures() {
    let bad1 = MockServer::new("bad1", ":9001").failing_listen().shared();
    let good = MockServer::new("good", ":9002").shared();
    let bad2 = MockServer::new("bad2", ":9003").failing_listen().shared();
    let pool = pool_of(&[&bad1, &good, &bad2]).await;

    let err = pool.listen("echo").await.expect_err("two members fail");

    for server in [&bad1, &good, &bad2] {
        assert_eq!(server.listens.load(Ordering::SeqCst), 1);
    }
    assert!(good.is_running());
    assert_eq!(*good.handler.lock().unwrap(), Some("echo"));

    let Error::Listen(failures) = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(failures.binds().collect::<Vec<_>>(), vec![":9001", ":9003"]);
    let msg = err.to_string();
    assert!(msg.contains(":9001") && msg.contains(":9003"));
    assert!(!msg.contains(":9002"));
}

#[tokio::test]
async fn listen_on_empty_pool_is_ok() {
    let pool: Pool<Handler> = Pool::default();
    assert!(pool.listen("echo").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listen_then_shutdown_three_servers() {
    let servers: Vec<Arc<MockServer>> = [":9001", ":9002", ":9003"]
        .iter()
        .map(|bind| MockServer::new("web", bind).shared())
        .collect();
    let pool = Pool::with_config(fast_config())
        .seeded(servers.iter().map(shared))
        .await;

    pool.listen("echo").await.expect("listen");
    assert!(pool.is_running(false));
    assert!(servers.iter().all(|s| s.is_running()));

    let start = Instant::now();
    pool.shutdown().await;
    assert!(start.elapsed() < fast_config().shutdown_timeout + Duration::from_millis(250));

    assert!(!pool.is_running(true));
    assert!(servers.iter().all(|s| s.shutdowns.load(Ordering::SeqCst) == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_returns_within_budget_when_members_hang() {
    let budget = Duration::from_millis(200);
    let config = PoolConfig::new()
        .with_shutdown_timeout(budget)
        .with_concurrency(4);
    let slow = MockServer::new("slow", ":9001")
        .running()
        .with_delay(Duration::from_secs(30))
        .shared();
    let fast = MockServer::new("fast", ":9002").running().shared();
    let pool = Pool::with_config(config)
        .seeded([shared(&slow), shared(&fast)])
        .await;

    let start = Instant::now();
    let report = pool.fan_out(Lifecycle::Shutdown).await;
    let elapsed = start.elapsed();

    assert!(elapsed >= budget);
    assert!(elapsed < budget + Duration::from_millis(500), "took {elapsed:?}");
    assert_eq!(report.members, 2);
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.abandoned(), 1);
    assert!(!fast.is_running());
    assert!(slow.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_stops_dispatching_when_budget_expires() {
    const MEMBERS: usize = 4;
    let budget = Duration::from_millis(200);
    let config = PoolConfig::new()
        .with_shutdown_timeout(budget)
        .with_concurrency(1);
    let servers: Vec<_> = (0..MEMBERS)
        .map(|i| {
            MockServer::new(&format!("hang-{i}"), &format!(":{}", 9001 + i))
                .running()
                .with_delay(Duration::from_secs(30))
                .shared()
        })
        .collect();
    let pool = Pool::with_config(config)
        .seeded(servers.iter().map(shared))
        .await;

    let start = Instant::now();
    let report = pool.fan_out(Lifecycle::Shutdown).await;
    let elapsed = start.elapsed();

    assert!(elapsed < budget + Duration::from_millis(500), "took {elapsed:?}");
    assert_eq!(report.members, MEMBERS);
    assert!(report.dispatched < report.members);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(report.abandoned(), MEMBERS - report.completed);
    assert!(!report.is_complete());
    assert!(servers.iter().all(|s| s.is_running()));

    let start = Instant::now();
    pool.shutdown().await;
    assert!(start.elapsed() < budget + Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_respects_concurrency() {
    let probe = Arc::new(Probe::default());
    let servers: Vec<SharedServer<Handler>> = (0..6)
        .map(|i| {
            MockServer::new("worker", &format!(":{}", 9000 + i))
                .with_delay(Duration::from_millis(30))
                .with_probe(&probe)
                .shared() as SharedServer<Handler>
        })
        .collect();
    let pool = Pool::with_config(fast_config().with_concurrency(2))
        .seeded(servers)
        .await;

    let report = pool.fan_out(Lifecycle::Restart).await;

    assert!(report.is_complete());
    assert_eq!(report.completed, 6);
    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(probe.active.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_reaches_every_member() {
    let a = MockServer::new("a", ":9001").shared();
    let b = MockServer::new("b", ":9002").running().shared();
    let pool = Pool::with_config(fast_config())
        .seeded([shared(&a), shared(&b)])
        .await;

    pool.restart().await;

    assert_eq!(a.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(b.restarts.load(Ordering::SeqCst), 1);
    assert!(pool.is_running(false));
}

#[tokio::test]
async fn fan_out_on_empty_pool_returns_immediately() {
    let pool: Pool<Handler> = Pool::default();
    let report = pool.fan_out(Lifecycle::Shutdown).await;
    assert_eq!(report, FanOutReport::default());
    assert!(report.is_complete());
}

#[tokio::test]
async fn wait_notify_shuts_down_on_notification() {
    let a = MockServer::new("a", ":9001").running().shared();
    let pool = Pool::with_config(fast_config()).seeded([shared(&a)]).await;
    let (tx, rx) = tokio::sync::oneshot::channel::<Notice>();

    let source = async move { rx.await.map_err(std::io::Error::other) };
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.wait_notify_with(source, CancellationToken::new()).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.is_running());
    tx.send(Notice::Terminate).expect("send");

    assert_eq!(waiter.await.expect("join"), Notice::Terminate);
    assert!(!a.is_running());
    assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wait_notify_shuts_down_on_cancellation() {
    let a = MockServer::new("a", ":9001").running().shared();
    let pool = Pool::with_config(fast_config()).seeded([shared(&a)]).await;
    let token = CancellationToken::new();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        let token = token.clone();
        async move {
            pool.wait_notify_with(core::future::pending(), token).await
        }
    });
    token.cancel();

    assert_eq!(waiter.await.expect("join"), Notice::Cancelled);
    assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wait_notify_falls_back_to_token_when_source_fails() {
    let a = MockServer::new("a", ":9001").running().shared();
    let pool = Pool::with_config(fast_config()).seeded([shared(&a)]).await;
    let token = CancellationToken::new();
    token.cancel();

    let failing = async { Err(std::io::Error::other("no signals here")) };
    let notice = pool.wait_notify_with(failing, token).await;

    assert_eq!(notice, Notice::Cancelled);
    assert!(!a.is_running());
}

#[tokio::test]
async fn map_update_replaces_members_and_keeps_binds_unique() {
    let a = MockServer::new("a", ":9001").shared();
    let b = MockServer::new("b", ":9002").shared();
    let pool = pool_of(&[&a, &b]).await;
    let replacement = MockServer::new("a2", ":9001").shared();

    let updated = pool.map_update(|server| {
        if server.bindable() == ":9001" {
            shared(&replacement)
        } else {
            server
        }
    });
    assert!(same(&updated.get(":9001").expect("present"), &replacement));
    assert!(same(&updated.get(":9002").expect("present"), &b));

    let collapsed = pool.map_update(|_| shared(&replacement));
    assert_eq!(collapsed.len(), 1);

    let mut seen = Vec::new();
    updated.map_run(|server| seen.push(server.name()));
    assert_eq!(seen, vec!["a2".to_string(), "b".to_string()]);
}
