/// Liquidity manager: decides which swaps would bring channel balances back
/// within the configured rules.
///
/// A single control loop owns the parameters and serves requests one at a
/// time, in arrival order. Each suggestion cycle:
/// 1. fetches swap restrictions, the channel listing and existing swaps;
/// 2. filters out channels that are busy with (or recently failed) swaps,
///    and private channels unless they are included;
/// 3. evaluates channel rules on their own channels, then the node rule over
///    the rest, or the peer rule per peer;
/// 4. quotes recommendations in evaluation order, dropping those over the
///    fee limits;
/// 5. stops accepting once the in-flight limit is reached.
pub mod balances;
pub mod eligibility;
pub mod error;
pub mod fees;
pub mod parameters;
pub mod restrictions;
pub mod rules;
pub mod swaps;

use crate::client::{LiquidityClient, SwapStore};
use crate::clock::Clock;
use balances::{Balances, ChannelInfo};
use eligibility::{eligible_channels, pending_count};
use error::{LiquidityError, Result};
use log::{debug, info, warn};
use parameters::Parameters;
use restrictions::Restrictions;
use rules::LiquidityRule;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use swaps::{Action, Reason, SwapRecommendation, SwapSet};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Requests waiting for the control loop beyond this block the caller.
const REQUEST_QUEUE_SIZE: usize = 16;

/// External collaborators of the manager.
#[derive(Clone)]
pub struct ManagerConfig {
    pub client: Arc<dyn LiquidityClient>,
    pub swaps: Arc<dyn SwapStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created without parameters.
    Unconfigured,
    /// Parameters set, control loop not started.
    Configured,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerState::Unconfigured => "unconfigured",
            ManagerState::Configured => "configured",
            ManagerState::Running => "running",
            ManagerState::ShuttingDown => "shutting down",
            ManagerState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// A recommendation removed before it was returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedSwap {
    pub action: Action,
    pub recommendation: SwapRecommendation,
    pub reason: Reason,
}

/// Result of one suggestion cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Suggestions {
    pub loop_out: Vec<SwapRecommendation>,
    pub loop_in: Vec<SwapRecommendation>,
    /// Every rule evaluation, including those with no action.
    pub evaluations: Vec<SwapSet>,
    pub dropped: Vec<DroppedSwap>,
}

impl Suggestions {
    pub fn is_empty(&self) -> bool {
        self.loop_out.is_empty() && self.loop_in.is_empty()
    }
}

enum Request {
    GetParameters {
        reply: oneshot::Sender<Parameters>,
    },
    SetParameters {
        params: Parameters,
        reply: oneshot::Sender<()>,
    },
    SuggestSwaps {
        ctx: CancellationToken,
        reply: oneshot::Sender<Result<Suggestions>>,
    },
}

/// What the control loop takes over when it starts.
struct Idle {
    requests: mpsc::Receiver<Request>,
    params: Parameters,
}

pub struct Manager {
    cfg: ManagerConfig,
    request_tx: mpsc::Sender<Request>,
    /// Present until `run` starts.
    idle: Mutex<Option<Idle>>,
    state: watch::Sender<ManagerState>,
}

impl Manager {
    pub fn new(cfg: ManagerConfig) -> Self {
        Self::build(cfg, Parameters::default(), ManagerState::Unconfigured)
    }

    pub fn with_parameters(cfg: ManagerConfig, params: Parameters) -> Result<Self> {
        params.validate()?;
        Ok(Self::build(cfg, params, ManagerState::Configured))
    }

    fn build(cfg: ManagerConfig, params: Parameters, state: ManagerState) -> Self {
        let (request_tx, requests) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (state, _) = watch::channel(state);
        Self {
            cfg,
            request_tx,
            idle: Mutex::new(Some(Idle { requests, params })),
            state,
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Serve requests until `shutdown` fires. Fails if already started.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let Idle {
            mut requests,
            mut params,
        } = self
            .idle
            .lock()
            .await
            .take()
            .ok_or(LiquidityError::AlreadyStarted)?;

        self.state.send_replace(ManagerState::Running);
        info!("Liquidity manager started: {}", params);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => self.handle(request, &mut params, &shutdown).await,
                    None => break,
                },
            }
        }

        self.state.send_replace(ManagerState::ShuttingDown);
        info!("Liquidity manager shutting down");
        // Queued callers see their reply slot dropped.
        drop(requests);
        self.state.send_replace(ManagerState::Stopped);
        Ok(())
    }

    async fn handle(&self, request: Request, params: &mut Parameters, shutdown: &CancellationToken) {
        match request {
            Request::GetParameters { reply } => {
                let _ = reply.send(params.clone());
            }
            Request::SetParameters { params: new, reply } => {
                info!("Liquidity parameters updated: {}", new);
                *params = new;
                let _ = reply.send(());
            }
            Request::SuggestSwaps { ctx, reply } => {
                let result = tokio::select! {
                    _ = ctx.cancelled() => Err(LiquidityError::Cancelled),
                    _ = shutdown.cancelled() => Err(LiquidityError::ShuttingDown),
                    result = self.suggest(params) => result,
                };
                if let Err(e) = &result {
                    debug!("Swap suggestion failed: {}", e);
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Enqueue a request for the control loop and wait for its reply.
    async fn request<T>(
        &self,
        ctx: &CancellationToken,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        if ctx.is_cancelled() {
            return Err(LiquidityError::Cancelled);
        }

        let (reply, response) = oneshot::channel();
        tokio::select! {
            _ = ctx.cancelled() => return Err(LiquidityError::Cancelled),
            sent = self.request_tx.send(make(reply)) => {
                sent.map_err(|_| LiquidityError::ShuttingDown)?
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => Err(LiquidityError::Cancelled),
            reply = response => reply.map_err(|_| LiquidityError::ShuttingDown),
        }
    }

    pub async fn get_parameters(&self, ctx: &CancellationToken) -> Result<Parameters> {
        if let Some(idle) = self.idle.lock().await.as_ref() {
            return Ok(idle.params.clone());
        }
        self.request(ctx, |reply| Request::GetParameters { reply })
            .await
    }

    /// Validate and replace the parameters wholesale.
    pub async fn set_parameters(&self, ctx: &CancellationToken, params: Parameters) -> Result<()> {
        params.validate()?;

        {
            let mut idle = self.idle.lock().await;
            if let Some(idle) = idle.as_mut() {
                idle.params = params;
                self.state.send_if_modified(|state| {
                    let first = *state == ManagerState::Unconfigured;
                    if first {
                        *state = ManagerState::Configured;
                    }
                    first
                });
                return Ok(());
            }
        }

        self.request(ctx, |reply| Request::SetParameters { params, reply })
            .await
    }

    /// Recommend swaps for the current channel balances. Waits for the
    /// control loop if it has not started yet.
    pub async fn suggest_swaps(&self, ctx: &CancellationToken) -> Result<Suggestions> {
        let ctx_for_loop = ctx.clone();
        self.request(ctx, |reply| Request::SuggestSwaps {
            ctx: ctx_for_loop,
            reply,
        })
        .await?
    }

    async fn restrictions(&self) -> Result<(Restrictions, Restrictions)> {
        let outbound = self
            .cfg
            .client
            .loop_out_restrictions()
            .await
            .map_err(LiquidityError::Upstream)?;
        outbound.validate().map_err(LiquidityError::Upstream)?;

        let inbound = self
            .cfg
            .client
            .loop_in_restrictions()
            .await
            .map_err(LiquidityError::Upstream)?;
        inbound.validate().map_err(LiquidityError::Upstream)?;

        Ok((outbound, inbound))
    }

    async fn suggest(&self, params: &Parameters) -> Result<Suggestions> {
        if !params.has_rules() {
            return Err(LiquidityError::NoRules);
        }

        let (out_restrictions, in_restrictions) = self.restrictions().await?;
        let channels = self
            .cfg
            .client
            .list_channels()
            .await
            .map_err(LiquidityError::Upstream)?;
        let existing = self
            .cfg
            .swaps
            .list_swaps()
            .await
            .map_err(LiquidityError::Upstream)?;

        let now = self.cfg.clock.now();
        let eligible: Vec<ChannelInfo> =
            eligible_channels(&channels, &existing, params.failure_backoff, now)
                .into_iter()
                .filter(|c| params.include_private || !c.private)
                .collect();

        debug!(
            "{} of {} channels eligible (out: {}, in: {})",
            eligible.len(),
            channels.len(),
            out_restrictions,
            in_restrictions
        );

        let mut suggestions = Suggestions::default();
        let mut evaluate = |rule: &dyn LiquidityRule, scope: &str, balances: &[Balances]| {
            let set = rule.evaluate(balances, &out_restrictions, &in_restrictions);
            debug!(
                "{} ({}): {} - {}, {} swaps",
                scope,
                rule,
                set.action,
                set.reason,
                set.swaps.len()
            );
            suggestions.evaluations.push(set);
        };

        let mut remaining: Vec<&ChannelInfo> = Vec::new();
        for channel in &eligible {
            match params.channel_rules.get(&channel.channel_id) {
                Some(rule) => evaluate(
                    rule,
                    &format!("channel {}", channel.channel_id),
                    &[Balances::from_channel(channel)],
                ),
                None => remaining.push(channel),
            }
        }

        if let Some(rule) = &params.node_rule {
            let balances: Vec<Balances> =
                remaining.iter().map(|c| Balances::from_channel(c)).collect();
            evaluate(rule, "node", &balances);
        }

        if let Some(rule) = &params.peer_rule {
            let mut by_peer: BTreeMap<&str, Vec<Balances>> = BTreeMap::new();
            for channel in &remaining {
                by_peer
                    .entry(channel.peer.as_str())
                    .or_default()
                    .push(Balances::from_channel(channel));
            }
            for (peer, balances) in by_peer {
                evaluate(rule, &format!("peer {}", peer), &balances);
            }
        }

        let recommendations: Vec<(Action, SwapRecommendation)> = suggestions
            .evaluations
            .iter()
            .flat_map(|set| set.swaps.iter().map(move |swap| (set.action, swap.clone())))
            .collect();

        // Only recommendations that pass their fee check take an in-flight
        // slot; once the slots are used up the rest are not quoted.
        let pending = pending_count(&existing);
        let allowed = params.max_in_flight.saturating_sub(pending);
        let mut accepted = 0;

        for (action, recommendation) in recommendations {
            if accepted >= allowed {
                warn!(
                    "Dropping {} of {}: {} swaps already in flight, limit {}",
                    action,
                    recommendation,
                    pending + accepted,
                    params.max_in_flight
                );
                suggestions.dropped.push(DroppedSwap {
                    action,
                    recommendation,
                    reason: Reason::InFlightLimit,
                });
                continue;
            }

            let fee_check = match action {
                Action::LoopOut => {
                    let quote = self
                        .cfg
                        .client
                        .loop_out_quote(recommendation.amount, params.conf_target)
                        .await
                        .map_err(LiquidityError::Upstream)?;
                    debug!("Loop out quote for {}: {:?}", recommendation, quote);
                    params.fee_limits.check_loop_out(recommendation.amount, &quote)
                }
                Action::LoopIn => {
                    let quote = self
                        .cfg
                        .client
                        .loop_in_quote(recommendation.amount)
                        .await
                        .map_err(LiquidityError::Upstream)?;
                    debug!("Loop in quote for {}: {:?}", recommendation, quote);
                    params.fee_limits.check_loop_in(recommendation.amount, &quote)
                }
                Action::None => continue,
            };

            match (fee_check, action) {
                (Ok(()), Action::LoopOut) => {
                    accepted += 1;
                    suggestions.loop_out.push(recommendation);
                }
                (Ok(()), _) => {
                    accepted += 1;
                    suggestions.loop_in.push(recommendation);
                }
                (Err(e), _) => {
                    warn!("Dropping {} of {}: {}", action, recommendation, e);
                    suggestions.dropped.push(DroppedSwap {
                        action,
                        recommendation,
                        reason: Reason::FeesTooHigh,
                    });
                }
            }
        }

        info!(
            "Suggested {} loop out and {} loop in swaps ({} dropped)",
            suggestions.loop_out.len(),
            suggestions.loop_in.len(),
            suggestions.dropped.len()
        );
        Ok(suggestions)
    }
}
