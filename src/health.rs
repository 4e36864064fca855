//! Cluster readiness checks.
//!
//! A check polls a fixed, caller-ordered set of agents in rounds. A round
//! queries every agent once, in order, and stops at the first error. The
//! cluster is healthy when a round finishes without errors and every agent
//! agrees on exactly one non-empty leader (and, for [`leader_peers_healthy`],
//! every agent reports the expected peer set). Polling only ends on success
//! or when the [`PollContext`] is cancelled or its deadline passes.

use std::{collections::BTreeSet, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};
use tracing::{debug, info};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Reports the current leader of a consensus group.
///
/// An empty string means no leader is elected right now; that is not an error.
pub trait LeaderApi: Send + Sync {
    fn leader(&self) -> ApiFuture<'_, String>;
}

/// A [`LeaderApi`] that can also list the voting members, as `host:port`.
pub trait LeaderPeersApi: LeaderApi {
    fn peers(&self) -> ApiFuture<'_, Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Transport { message: String },
    Status { status: u16, body: String },
    Decode { message: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { message } => write!(f, "request failed: {message}"),
            Self::Status { status, body } => write!(f, "unexpected status {status}: {body}"),
            Self::Decode { message } => write!(f, "decode response: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for ContextError {}

/// Cancellation and deadline for a polling operation.
///
/// Clones share the same cancellation flag.
#[derive(Debug, Clone)]
pub struct PollContext {
    deadline: Option<Instant>,
    cancel: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

impl PollContext {
    pub fn background() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            deadline: None,
            cancel: Arc::new(tx),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    /// Narrows the deadline; cancellation stays shared with `self`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn err(&self) -> Option<ContextError> {
        if *self.cancel.borrow() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Sleeps for `dur`, returning early if the context ends first.
    pub async fn sleep(&self, dur: Duration) -> Result<(), ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let mut until = Instant::now() + dur;
        if let Some(deadline) = self.deadline {
            until = until.min(deadline);
        }

        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            _ = tokio::time::sleep_until(until) => {}
            _ = async { let _ = cancelled.wait_for(|c| *c).await; } => {}
        }

        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or past its deadline.
    pub async fn done(&self) -> ContextError {
        loop {
            if let Some(err) = self.err() {
                return err;
            }
            let _ = self.sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub interval: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
        }
    }
}

/// Why a check gave up, with what the last round observed.
#[derive(Debug, Clone)]
pub struct HealthError {
    pub cause: ContextError,
    pub rounds: u64,
    pub errors: Vec<String>,
    pub leaders: BTreeSet<String>,
    /// Sorted peer lists per agent, for peer-aware checks.
    pub peers: Option<Vec<Vec<String>>>,
    pub expected_peers: Option<Vec<String>>,
}

impl fmt::Display for HealthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster not healthy after {} rounds ({}): errors={:?} leaders={:?}",
            self.rounds, self.cause, self.errors, self.leaders
        )?;
        if let Some(peers) = &self.peers {
            write!(f, " peers={peers:?}")?;
        }
        if let Some(expected) = &self.expected_peers {
            write!(f, " expected_peers={expected:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HealthError {}

#[derive(Debug, Default)]
struct Round {
    errors: Vec<String>,
    leaders: BTreeSet<String>,
    peers: Vec<Vec<String>>,
}

impl Round {
    fn single_leader(&self) -> Option<&String> {
        if self.errors.is_empty() && self.leaders.len() == 1 {
            self.leaders.iter().next()
        } else {
            None
        }
    }
}

pub async fn leaders_healthy(
    ctx: &PollContext,
    apis: &[Arc<dyn LeaderApi>],
) -> Result<String, HealthError> {
    leaders_healthy_with_options(ctx, apis, &HealthOptions::default()).await
}

pub async fn leaders_healthy_with_options(
    ctx: &PollContext,
    apis: &[Arc<dyn LeaderApi>],
    opts: &HealthOptions,
) -> Result<String, HealthError> {
    let mut last = Round::default();
    let mut rounds = 0_u64;

    loop {
        if let Some(cause) = ctx.err() {
            return Err(HealthError {
                cause,
                rounds,
                errors: last.errors,
                leaders: last.leaders,
                peers: None,
                expected_peers: None,
            });
        }

        let mut round = Round::default();
        for api in apis {
            match api.leader().await {
                Ok(leader) if leader.is_empty() => {}
                Ok(leader) => {
                    round.leaders.insert(leader);
                }
                Err(err) => {
                    round.errors.push(err.to_string());
                    break;
                }
            }
        }
        rounds += 1;

        if let Some(leader) = round.single_leader() {
            info!(leader = %leader, rounds, agents = apis.len(), "cluster converged");
            return Ok(leader.clone());
        }

        debug!(
            round = rounds,
            errors = ?round.errors,
            leaders = ?round.leaders,
            "cluster not converged yet"
        );
        last = round;
        let _ = ctx.sleep(opts.interval).await;
    }
}

pub async fn leader_peers_healthy(
    ctx: &PollContext,
    apis: &[Arc<dyn LeaderPeersApi>],
    expected_peers: &[String],
) -> Result<String, HealthError> {
    leader_peers_healthy_with_options(ctx, apis, expected_peers, &HealthOptions::default()).await
}

/// Like [`leaders_healthy`], but every agent must also report exactly the
/// expected peers. Peer lists are compared sorted.
pub async fn leader_peers_healthy_with_options(
    ctx: &PollContext,
    apis: &[Arc<dyn LeaderPeersApi>],
    expected_peers: &[String],
    opts: &HealthOptions,
) -> Result<String, HealthError> {
    let mut expected = expected_peers.to_vec();
    expected.sort();

    let mut last = Round::default();
    let mut rounds = 0_u64;

    loop {
        if let Some(cause) = ctx.err() {
            return Err(HealthError {
                cause,
                rounds,
                errors: last.errors,
                leaders: last.leaders,
                peers: Some(last.peers),
                expected_peers: Some(expected),
            });
        }

        let mut round = Round::default();
        for api in apis {
            match api.leader().await {
                Ok(leader) => {
                    if !leader.is_empty() {
                        round.leaders.insert(leader);
                    }
                }
                Err(err) => {
                    round.errors.push(err.to_string());
                    break;
                }
            }
            match api.peers().await {
                Ok(mut peers) => {
                    peers.sort();
                    round.peers.push(peers);
                }
                Err(err) => {
                    round.errors.push(err.to_string());
                    break;
                }
            }
        }
        rounds += 1;

        let peers_match = round.peers.iter().all(|peers| *peers == expected);
        if peers_match && let Some(leader) = round.single_leader() {
            info!(
                leader = %leader,
                rounds,
                agents = apis.len(),
                peers = expected.len(),
                "cluster converged"
            );
            return Ok(leader.clone());
        }

        debug!(
            round = rounds,
            errors = ?round.errors,
            leaders = ?round.leaders,
            peers = ?round.peers,
            "cluster not converged yet"
        );
        last = round;
        let _ = ctx.sleep(opts.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Step {
        leader: Result<&'static str, &'static str>,
        peers: Result<Vec<&'static str>, &'static str>,
    }

    fn ok(leader: &'static str, peers: &[&'static str]) -> Step {
        Step {
            leader: Ok(leader),
            peers: Ok(peers.to_vec()),
        }
    }

    fn down(message: &'static str) -> Step {
        Step {
            leader: Err(message),
            peers: Err(message),
        }
    }

    /// Replays one step per round; the last step repeats forever.
    struct ScriptedApi {
        steps: Vec<Step>,
        leader_calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            assert!(!steps.is_empty());
            Arc::new(Self {
                steps,
                leader_calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.leader_calls.load(Ordering::SeqCst)
        }

        fn step(&self, index: usize) -> Step {
            self.steps[index.min(self.steps.len() - 1)].clone()
        }
    }

    impl LeaderApi for ScriptedApi {
        fn leader(&self) -> ApiFuture<'_, String> {
            let step = self.step(self.leader_calls.fetch_add(1, Ordering::SeqCst));
            Box::pin(async move {
                step.leader
                    .map(str::to_string)
                    .map_err(|message| ApiError::Transport {
                        message: message.to_string(),
                    })
            })
        }
    }

    impl LeaderPeersApi for ScriptedApi {
        fn peers(&self) -> ApiFuture<'_, Vec<String>> {
            let step = self.step(self.calls().saturating_sub(1));
            Box::pin(async move {
                step.peers
                    .map(|peers| peers.into_iter().map(str::to_string).collect())
                    .map_err(|message| ApiError::Transport {
                        message: message.to_string(),
                    })
            })
        }
    }

    fn fast() -> HealthOptions {
        HealthOptions {
            interval: Duration::from_millis(10),
        }
    }

    fn leader_apis(apis: &[Arc<ScriptedApi>]) -> Vec<Arc<dyn LeaderApi>> {
        apis.iter()
            .map(|api| api.clone() as Arc<dyn LeaderApi>)
            .collect()
    }

    fn peer_apis(apis: &[Arc<ScriptedApi>]) -> Vec<Arc<dyn LeaderPeersApi>> {
        apis.iter()
            .map(|api| api.clone() as Arc<dyn LeaderPeersApi>)
            .collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    const PEERS: [&str; 3] = ["10.0.0.1:8300", "10.0.0.2:8300", "10.0.0.3:8300"];

    #[tokio::test]
    async fn agreeing_leaders_converge_in_first_round() {
        let apis: Vec<_> = (0..3)
            .map(|_| ScriptedApi::new(vec![ok("L", &[])]))
            .collect();
        let ctx = PollContext::timeout(Duration::from_secs(5));

        let leader = leaders_healthy_with_options(&ctx, &leader_apis(&apis), &fast())
            .await
            .unwrap();

        assert_eq!(leader, "L");
        for api in &apis {
            assert_eq!(api.calls(), 1);
        }
    }

    #[tokio::test]
    async fn no_leader_anywhere_times_out() {
        let apis: Vec<_> = (0..3)
            .map(|_| ScriptedApi::new(vec![ok("", &PEERS)]))
            .collect();
        let ctx = PollContext::timeout(Duration::from_millis(150));

        let err = leaders_healthy_with_options(&ctx, &leader_apis(&apis), &fast())
            .await
            .unwrap_err();

        assert_eq!(err.cause, ContextError::DeadlineExceeded);
        assert!(err.leaders.is_empty());
        assert!(err.errors.is_empty());
        assert!(err.rounds > 1);
    }

    #[tokio::test]
    async fn split_vote_waits_for_agreement() {
        let a = ScriptedApi::new(vec![ok("n1", &[]), ok("n1", &[])]);
        let b = ScriptedApi::new(vec![ok("n2", &[]), ok("n1", &[])]);
        let c = ScriptedApi::new(vec![ok("", &[]), ok("n1", &[])]);
        let apis = vec![a.clone(), b.clone(), c.clone()];
        let ctx = PollContext::timeout(Duration::from_secs(5));

        let leader = leaders_healthy_with_options(&ctx, &leader_apis(&apis), &fast())
            .await
            .unwrap();

        assert_eq!(leader, "n1");
        assert_eq!(a.calls(), 2);
        assert_eq!(c.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_split_vote_reports_both_leaders() {
        let apis = vec![
            ScriptedApi::new(vec![ok("n1", &[])]),
            ScriptedApi::new(vec![ok("n2", &[])]),
        ];
        let ctx = PollContext::timeout(Duration::from_millis(100));

        let err = leaders_healthy_with_options(&ctx, &leader_apis(&apis), &fast())
            .await
            .unwrap_err();

        assert_eq!(err.leaders, BTreeSet::from(["n1".to_string(), "n2".to_string()]));
        assert!(err.to_string().contains("n2"));
    }

    #[tokio::test]
    async fn unordered_peers_match_expected_set() {
        let shuffled = [PEERS[2], PEERS[0], PEERS[1]];
        let apis = vec![
            ScriptedApi::new(vec![ok(PEERS[0], &shuffled)]),
            ScriptedApi::new(vec![ok(PEERS[0], &PEERS)]),
        ];
        let ctx = PollContext::timeout(Duration::from_secs(5));

        let leader =
            leader_peers_healthy_with_options(&ctx, &peer_apis(&apis), &strings(&PEERS), &fast())
                .await
                .unwrap();

        assert_eq!(leader, PEERS[0]);
    }

    #[tokio::test]
    async fn peer_mismatch_blocks_until_membership_is_corrected() {
        let partial = [PEERS[0], PEERS[1]];
        let extra = [PEERS[0], PEERS[1], PEERS[2], "10.0.0.9:8300"];
        let api = ScriptedApi::new(vec![
            ok(PEERS[0], &partial),
            ok(PEERS[0], &extra),
            ok(PEERS[0], &PEERS),
        ]);
        let ctx = PollContext::timeout(Duration::from_secs(5));

        let leader = leader_peers_healthy_with_options(
            &ctx,
            &peer_apis(std::slice::from_ref(&api)),
            &strings(&PEERS),
            &fast(),
        )
        .await
        .unwrap();

        assert_eq!(leader, PEERS[0]);
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn wrong_membership_times_out_with_peer_diagnostics() {
        let api = ScriptedApi::new(vec![ok(PEERS[0], &[PEERS[0]])]);
        let ctx = PollContext::timeout(Duration::from_millis(100));

        let err = leader_peers_healthy_with_options(
            &ctx,
            &peer_apis(&[api]),
            &strings(&PEERS),
            &fast(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.peers, Some(vec![strings(&[PEERS[0]])]));
        assert_eq!(err.expected_peers, Some(strings(&PEERS)));
        assert!(err.to_string().contains("expected_peers"));
    }

    #[tokio::test]
    async fn every_agent_must_report_expected_peers() {
        let stale = ScriptedApi::new(vec![ok(PEERS[0], &[PEERS[0]])]);
        let last = ScriptedApi::new(vec![ok(PEERS[0], &PEERS)]);
        let ctx = PollContext::timeout(Duration::from_millis(100));

        let err = leader_peers_healthy_with_options(
            &ctx,
            &peer_apis(&[stale, last]),
            &strings(&PEERS),
            &fast(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.cause, ContextError::DeadlineExceeded);
        assert_eq!(err.leaders.len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_recover_and_abort_the_round() {
        let first = ScriptedApi::new(vec![
            down("connection refused"),
            down("connection refused"),
            ok(PEERS[0], &PEERS),
        ]);
        let second = ScriptedApi::new(vec![ok(PEERS[0], &PEERS)]);
        let ctx = PollContext::timeout(Duration::from_secs(5));

        let leader = leader_peers_healthy_with_options(
            &ctx,
            &peer_apis(&[first.clone(), second.clone()]),
            &strings(&PEERS),
            &fast(),
        )
        .await
        .unwrap();

        assert_eq!(leader, PEERS[0]);
        assert_eq!(first.calls(), 3);
        // Rounds that failed on `first` never reached `second`.
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn errors_are_reported_on_timeout() {
        let api = ScriptedApi::new(vec![down("connection refused")]);
        let ctx = PollContext::timeout(Duration::from_millis(80));

        let err = leaders_healthy_with_options(&ctx, &leader_apis(&[api]), &fast())
            .await
            .unwrap_err();

        assert_eq!(err.errors.len(), 1);
        assert!(err.errors[0].contains("connection refused"));
    }

    #[tokio::test]
    async fn cancelled_context_returns_without_polling() {
        let api = ScriptedApi::new(vec![ok("", &[]), ok("L", &[])]);
        let ctx = PollContext::background();
        ctx.cancel();

        let apis = leader_apis(std::slice::from_ref(&api));
        let err = leaders_healthy_with_options(&ctx, &apis, &fast())
            .await
            .unwrap_err();

        assert_eq!(err.cause, ContextError::Cancelled);
        assert_eq!(err.rounds, 0);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_the_inter_round_sleep() {
        let api = ScriptedApi::new(vec![ok("", &[])]);
        let ctx = PollContext::background();
        let handle = ctx.cancel_handle();
        let slow = HealthOptions {
            interval: Duration::from_secs(30),
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            leaders_healthy_with_options(&ctx, &leader_apis(&[api]), &slow),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert_eq!(err.cause, ContextError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn three_consul_servers_converge_with_unsorted_peers() {
        let reported = [PEERS[1], PEERS[0], PEERS[2]];
        let apis: Vec<_> = (0..3)
            .map(|_| ScriptedApi::new(vec![ok("10.0.0.1:8300", &reported)]))
            .collect();
        let ctx = PollContext::timeout(Duration::from_secs(5));

        let leader = leader_peers_healthy(&ctx, &peer_apis(&apis), &strings(&PEERS))
            .await
            .unwrap();

        assert_eq!(leader, "10.0.0.1:8300");
        for api in &apis {
            assert_eq!(api.calls(), 1);
        }
    }

    #[tokio::test]
    async fn narrowed_context_keeps_earlier_deadline_and_shared_cancel() {
        let parent = PollContext::timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        child.cancel();
        assert_eq!(parent.err(), Some(ContextError::Cancelled));
    }
}
