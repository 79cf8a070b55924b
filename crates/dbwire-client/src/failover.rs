//! Failover coordinator and host health registry.
//!
//! The coordinator turns a host list and an HA mode into a connected
//! [`ProtocolEngine`]:
//!
//! 1. drop hosts whose denylist entry has not expired;
//! 2. order the rest (identity order, or load-weighted random); NONE mode
//!    only ever uses the first configured host;
//! 3. try each one; a failed host is denylisted for `denied_list_timeout`;
//! 4. after `retries_all_down` attempts report no host available, otherwise
//!    sleep `wait_reconnect_timeout` and start another pass.
//!
//! Every try of one host counts as one attempt, so `retries_all_down = 4`
//! means exactly four handshakes are tried.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

use crate::config::{Configuration, HaMode, HostAddress};
use crate::engine::ProtocolEngine;
use dbwire_core::error::ConnectionErrorKind;
use dbwire_core::{Error, Result};

/// Health data for one host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostHealth {
    /// Host is skipped until this instant
    pub denied_until: Option<Instant>,
    /// Sessions this process holds open to the host. Load balancing
    /// weighs hosts by this client-side count, not by the server's own
    /// `Threads_connected` status variable.
    pub threads_connected: u32,
}

/// Host health shared by every connection built from one configuration.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: DashMap<HostAddress, HostHealth>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip `host` for `duration`.
    pub fn deny(&self, host: &HostAddress, duration: Duration) {
        self.hosts.entry(host.clone()).or_default().denied_until = Some(Instant::now() + duration);
    }

    /// Clear the denylist entry of `host`.
    pub fn allow(&self, host: &HostAddress) {
        if let Some(mut health) = self.hosts.get_mut(host) {
            health.denied_until = None;
        }
    }

    pub fn is_denied(&self, host: &HostAddress) -> bool {
        self.denied_until(host)
            .is_some_and(|until| until > Instant::now())
    }

    pub fn denied_until(&self, host: &HostAddress) -> Option<Instant> {
        self.hosts.get(host).and_then(|health| health.denied_until)
    }

    pub fn connection_opened(&self, host: &HostAddress) {
        self.hosts.entry(host.clone()).or_default().threads_connected += 1;
    }

    pub fn connection_closed(&self, host: &HostAddress) {
        if let Some(mut health) = self.hosts.get_mut(host) {
            health.threads_connected = health.threads_connected.saturating_sub(1);
        }
    }

    pub fn threads_connected(&self, host: &HostAddress) -> u32 {
        self.hosts
            .get(host)
            .map_or(0, |health| health.threads_connected)
    }

    /// Copy of the current health data.
    pub fn snapshot(&self) -> Vec<(HostAddress, HostHealth)> {
        let mut hosts: Vec<_> = self
            .hosts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        hosts.sort_by(|a, b| a.0.cmp(&b.0));
        hosts
    }
}

/// Bookkeeping for one reconnect sequence.
///
/// The budget is counted in attempts only; a sequence has no deadline.
/// Its length is bounded by `retries_all_down` tries of at most
/// `connect_timeout` each plus the sleeps between passes.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    started: Instant,
    last_error: Option<Error>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
            last_error: None,
        }
    }
}

/// Produces connected engines from a host list.
#[derive(Debug, Clone)]
pub struct FailoverCoordinator {
    addresses: Vec<HostAddress>,
    mode: HaMode,
    retries_all_down: u32,
    wait_reconnect_timeout: Duration,
    denied_list_timeout: Duration,
    registry: Arc<HostRegistry>,
}

impl FailoverCoordinator {
    pub fn new(config: &Configuration) -> Self {
        Self {
            addresses: config.addresses.clone(),
            mode: config.ha_mode,
            retries_all_down: config.retries_all_down,
            wait_reconnect_timeout: config.wait_reconnect_timeout,
            denied_list_timeout: config.denied_list_timeout,
            registry: Arc::clone(config.host_registry()),
        }
    }

    pub fn mode(&self) -> HaMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// Open an engine to the first host that accepts.
    pub fn connect(&self, config: &Configuration) -> Result<ProtocolEngine> {
        self.connect_with(|host| ProtocolEngine::connect(config, host))
            .map(|(engine, _)| engine)
    }

    /// Run the retry algorithm with `open` as the per-host connect step.
    #[tracing::instrument(level = "debug", skip_all, fields(mode = ?self.mode))]
    pub fn connect_with<T, F>(&self, mut open: F) -> Result<(T, HostAddress)>
    where
        F: FnMut(&HostAddress) -> Result<T>,
    {
        if self.addresses.is_empty() {
            return Err(Error::no_host_available(0, None));
        }
        let budget = self.retries_all_down.max(1);
        let mut state = RetryState::new();

        loop {
            for host in self.candidates(&mut rand::thread_rng()) {
                state.attempt += 1;
                match open(&host) {
                    Ok(value) => {
                        self.registry.allow(&host);
                        if state.attempt > 1 {
                            tracing::info!(
                                host = %host,
                                attempt = state.attempt,
                                elapsed_ms = state.started.elapsed().as_millis(),
                                "Connected after failed attempts"
                            );
                        }
                        return Ok((value, host));
                    }
                    Err(e) if !is_host_failure(&e) => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            host = %host,
                            attempt = state.attempt,
                            error = %e,
                            deny_ms = self.denied_list_timeout.as_millis(),
                            "Connection attempt failed, denylisting host"
                        );
                        self.registry.deny(&host, self.denied_list_timeout);
                        state.last_error = Some(e);
                    }
                }
                if state.attempt >= budget {
                    return Err(Error::no_host_available(
                        state.attempt,
                        state.last_error.take(),
                    ));
                }
            }
            thread::sleep(self.wait_reconnect_timeout);
        }
    }

    /// Hosts to try in the next pass, in order.
    ///
    /// When every host is denylisted they are all offered again, the one
    /// whose entry expires first leading.
    pub fn candidates<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<HostAddress> {
        let hosts = match self.mode {
            HaMode::None => &self.addresses[..self.addresses.len().min(1)],
            HaMode::Sequential | HaMode::LoadBalance => &self.addresses[..],
        };
        let available: Vec<HostAddress> = hosts
            .iter()
            .filter(|host| !self.registry.is_denied(host))
            .cloned()
            .collect();

        if available.is_empty() {
            let mut denied = hosts.to_vec();
            denied.sort_by_key(|host| self.registry.denied_until(host));
            return denied;
        }

        match self.mode {
            HaMode::None | HaMode::Sequential => available,
            HaMode::LoadBalance => {
                let weighted = available
                    .into_iter()
                    .map(|host| {
                        let threads = self.registry.threads_connected(&host);
                        (host, threads)
                    })
                    .collect();
                weighted_order(weighted, rng)
            }
        }
    }
}

/// Authentication and configuration problems are the same on every host.
fn is_host_failure(error: &Error) -> bool {
    match error {
        Error::Config(_) => false,
        Error::Connection(c) => c.kind != ConnectionErrorKind::Authentication,
        _ => true,
    }
}

/// Random order where a host's chance to come next is proportional to
/// `1 / (1 + threads_connected)`.
fn weighted_order<R: Rng + ?Sized>(mut hosts: Vec<(HostAddress, u32)>, rng: &mut R) -> Vec<HostAddress> {
    let weight = |threads: u32| 1.0 / (1.0 + f64::from(threads));
    let mut ordered = Vec::with_capacity(hosts.len());
    while !hosts.is_empty() {
        let total: f64 = hosts.iter().map(|(_, threads)| weight(*threads)).sum();
        let mut pick = rng.gen_range(0.0..total);
        let mut index = hosts.len() - 1;
        for (i, (_, threads)) in hosts.iter().enumerate() {
            let w = weight(*threads);
            if pick < w {
                index = i;
                break;
            }
            pick -= w;
        }
        ordered.push(hosts.remove(index).0);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbwire_core::error::ConnectionError;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn refused(host: &HostAddress) -> Error {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: format!("connection refused by {host}"),
            source: None,
        })
    }

    fn coordinator(mode: HaMode, hosts: &[&str], retries: u32) -> FailoverCoordinator {
        let addresses = hosts
            .iter()
            .map(|h| HostAddress::parse(h).unwrap())
            .collect();
        let config = Configuration::new()
            .addresses(addresses)
            .ha_mode(mode)
            .retries_all_down(retries)
            .wait_reconnect_timeout(Duration::from_millis(1))
            .denied_list_timeout(Duration::from_secs(60));
        FailoverCoordinator::new(&config)
    }

    #[test]
    fn test_denylist_expires() {
        let registry = HostRegistry::new();
        let host = HostAddress::new("db1", 3306);
        registry.deny(&host, Duration::from_millis(20));
        assert!(registry.is_denied(&host));
        thread::sleep(Duration::from_millis(30));
        assert!(!registry.is_denied(&host));

        registry.deny(&host, Duration::from_secs(60));
        registry.allow(&host);
        assert!(!registry.is_denied(&host));
    }

    #[test]
    fn test_thread_accounting() {
        let registry = HostRegistry::new();
        let host = HostAddress::new("db1", 3306);
        registry.connection_opened(&host);
        registry.connection_opened(&host);
        registry.connection_closed(&host);
        assert_eq!(registry.threads_connected(&host), 1);
        registry.connection_closed(&host);
        registry.connection_closed(&host);
        assert_eq!(registry.threads_connected(&host), 0);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_exhaustion_counts_every_host_try() {
        let coord = coordinator(HaMode::Sequential, &["db1:3306", "db2:3306"], 4);
        let mut tried = Vec::new();
        let result: Result<((), HostAddress)> = coord.connect_with(|host| {
            tried.push(host.host.clone());
            Err(refused(host))
        });

        assert_eq!(tried.len(), 4);
        assert_eq!(tried[..2], ["db1", "db2"]);
        match result {
            Err(Error::Connection(c)) => {
                assert_eq!(c.kind, ConnectionErrorKind::NoHostAvailable);
                assert!(c.message.contains("after 4 attempts"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_sequential_skips_denied_and_sticks_to_first_success() {
        let coord = coordinator(HaMode::Sequential, &["db1", "db2", "db3"], 10);
        let db1 = HostAddress::parse("db1").unwrap();
        coord.registry().deny(&db1, Duration::from_secs(60));

        let mut tried = Vec::new();
        let (_, host) = coord
            .connect_with(|host| {
                tried.push(host.host.clone());
                if host.host == "db2" {
                    Err(refused(host))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(host.host, "db3");
        assert_eq!(tried, ["db2", "db3"]);
        assert!(coord.registry().is_denied(&HostAddress::parse("db2").unwrap()));
        assert!(!coord.registry().is_denied(&host));
    }

    #[test]
    fn test_all_denied_hosts_are_retried_by_expiry() {
        let coord = coordinator(HaMode::Sequential, &["db1", "db2"], 10);
        let db1 = HostAddress::parse("db1").unwrap();
        let db2 = HostAddress::parse("db2").unwrap();
        coord.registry().deny(&db1, Duration::from_secs(120));
        coord.registry().deny(&db2, Duration::from_secs(60));

        let order = coord.candidates(&mut rand::thread_rng());
        assert_eq!(order, vec![db2, db1]);
    }

    #[test]
    fn test_none_mode_uses_only_first_host() {
        let coord = coordinator(HaMode::None, &["db1", "db2", "db3"], 3);
        let db1 = HostAddress::parse("db1").unwrap();
        assert_eq!(coord.candidates(&mut rand::thread_rng()), vec![db1.clone()]);

        let mut tried = Vec::new();
        let result: Result<((), HostAddress)> = coord.connect_with(|host| {
            tried.push(host.host.clone());
            Err(refused(host))
        });
        assert!(result.is_err());
        assert_eq!(tried, ["db1", "db1", "db1"]);

        // A denylisted single host is still offered
        assert!(coord.registry().is_denied(&db1));
        assert_eq!(coord.candidates(&mut rand::thread_rng()), vec![db1]);
    }

    #[test]
    fn test_authentication_failure_stops_immediately() {
        let coord = coordinator(HaMode::Sequential, &["db1", "db2"], 10);
        let mut attempts = 0;
        let result: Result<((), HostAddress)> = coord.connect_with(|_| {
            attempts += 1;
            Err(crate::auth::auth_error("Access denied"))
        });
        assert_eq!(attempts, 1);
        assert!(matches!(
            result,
            Err(Error::Connection(ref c)) if c.kind == ConnectionErrorKind::Authentication
        ));
    }

    #[test]
    fn test_load_balance_prefers_idle_hosts() {
        let coord = coordinator(HaMode::LoadBalance, &["busy", "idle"], 1);
        let busy = HostAddress::parse("busy").unwrap();
        for _ in 0..9 {
            coord.registry().connection_opened(&busy);
        }

        let mut rng = StdRng::seed_from_u64(7);
        let idle_first = (0..1000)
            .filter(|_| coord.candidates(&mut rng)[0].host == "idle")
            .count();
        // Weights 1.0 vs 0.1
        assert!(idle_first > 800, "idle host led {idle_first} times");
        assert_eq!(coord.candidates(&mut rng).len(), 2);
    }
}
