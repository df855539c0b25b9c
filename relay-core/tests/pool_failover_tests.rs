//! Pool, backoff and options working together the way the engine drives them.

use relay_core::endpoint::ServerAddr;
use relay_core::options::ClientOptions;
use relay_core::pool::ServerPool;
use relay_core::reconnect::ReconnectState;
use std::time::Duration;

#[test]
fn test_failover_cycle_over_seeds_and_discovered() {
    let opts = ClientOptions::new()
        .with_servers(["nats://a:4222", "nats://b:4222"])
        .with_randomize(false)
        .with_max_reconnect_attempts(Some(2));
    let mut pool = ServerPool::new(opts.server_addrs().unwrap(), opts.randomize);

    // Connect to `a`, which announces `c`.
    let first = pool.next_candidate(opts.max_reconnect_attempts).unwrap();
    assert_eq!(first.host(), "a");
    pool.mark_attempt(first.addr());
    pool.mark_connected(first.addr(), false);
    let added = pool.merge_discovered(&["c:4222"]);
    assert_eq!(added, vec![ServerAddr::new("c", 4222)]);

    // `a` goes away: every other server is tried before `a` comes around again.
    let mut order = Vec::new();
    for _ in 0..3 {
        let entry = pool.next_candidate(opts.max_reconnect_attempts).unwrap();
        order.push(entry.host().to_string());
        pool.mark_attempt(entry.addr());
        pool.mark_failed(entry.addr(), false);
    }
    order.sort();
    assert_eq!(order, vec!["a", "b", "c"]);

    // Second round uses up the budget of two attempts per server.
    for _ in 0..3 {
        let entry = pool.next_candidate(opts.max_reconnect_attempts).unwrap();
        pool.mark_failed(entry.addr(), false);
    }
    assert!(pool.next_candidate(opts.max_reconnect_attempts).is_none());
    assert!(pool.is_empty());
}

#[test]
fn test_backoff_from_options() {
    let opts = ClientOptions::new()
        .with_reconnect_time_wait(Duration::from_millis(100))
        .with_reconnect_time_wait_max(Duration::from_millis(300));
    let mut reconnect = ReconnectState::new(&opts);

    assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
    assert_eq!(reconnect.next_delay(), Duration::from_millis(200));
    assert_eq!(reconnect.next_delay(), Duration::from_millis(300));
    assert_eq!(reconnect.next_delay(), Duration::from_millis(300));

    reconnect.reset();
    assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
}

#[test]
fn test_fixed_wait_without_max() {
    let opts = ClientOptions::new().with_reconnect_time_wait(Duration::from_millis(250));
    let mut reconnect = ReconnectState::new(&opts);
    for _ in 0..5 {
        assert_eq!(reconnect.next_delay(), Duration::from_millis(250));
    }
}
