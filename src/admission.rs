//! Admission-control facade owning every limiter tier.

use std::sync::Arc;

use tracing::{info, trace};

use crate::clock::Clock;
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::quota::QuotaOracle;
use crate::ratelimit::{
    AdaptiveLimiter, CircuitBreakerLimiter, Decision, IdleSweeper, InvitationLimiter, KeyedLimiterRegistry,
    LimiterKey, MethodLimiter, QuotaGatedLimiter, SweeperHandle,
};

/// All limiters of the subsystem, built once at service start.
///
/// Every limiter shares the same clock. Registries are swept by the
/// [`IdleSweeper`] returned from [`AdmissionControl::sweeper`].
#[derive(Debug)]
pub struct AdmissionControl {
    config: TurnstileConfig,
    clients: Arc<KeyedLimiterRegistry>,
    users: Arc<KeyedLimiterRegistry>,
    methods: MethodLimiter,
    organizations: QuotaGatedLimiter,
    adaptive: AdaptiveLimiter,
    breaker: CircuitBreakerLimiter,
    invitations: Arc<InvitationLimiter>,
}

impl AdmissionControl {
    /// Validate `config` and build every limiter.
    pub fn new(config: TurnstileConfig, oracle: Arc<dyn QuotaOracle>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let policy = config.sweeper.policy();

        let clients = Arc::new(
            KeyedLimiterRegistry::new("client", config.client.limits()?, clock.clone()).with_sweep_policy(policy),
        );
        let users = Arc::new(
            KeyedLimiterRegistry::new("user", config.user.limits()?, clock.clone()).with_sweep_policy(policy),
        );

        let methods = MethodLimiter::with_default(
            &config.methods.rules()?,
            config.methods.default.limits()?,
            clock.clone(),
        )?;
        methods.registry().set_sweep_policy(policy);

        let organizations = QuotaGatedLimiter::new(
            oracle,
            Arc::new(
                KeyedLimiterRegistry::new("organization", config.organization.template()?, clock.clone())
                    .with_sweep_policy(policy),
            ),
            config.organization.policy(),
        )?;

        let adaptive = AdaptiveLimiter::new(config.adaptive.bounds(), clock.clone())?;
        adaptive.registry().set_sweep_policy(policy);

        let breaker = CircuitBreakerLimiter::new(
            config.circuit_breaker.settings(),
            Arc::new(
                KeyedLimiterRegistry::new("circuit_breaker", config.circuit_breaker.limit.limits()?, clock.clone())
                    .with_sweep_policy(policy),
            ),
        )?;

        let invitations = Arc::new(InvitationLimiter::new(
            config.invitation.user_limit,
            config.invitation.org_limit,
            clock,
        )?);

        info!(
            fail_open = config.organization.fail_open,
            method_rules = config.methods.rules.len(),
            "Admission control initialized"
        );

        Ok(Self {
            config,
            clients,
            users,
            methods,
            organizations,
            adaptive,
            breaker,
            invitations,
        })
    }

    /// Rate limit a request by client address.
    pub fn check_client(&self, addr: &str) -> Decision {
        self.clients.check(&LimiterKey::client(addr))
    }

    /// Rate limit a request by authenticated user.
    pub fn check_user(&self, user_id: &str) -> Decision {
        self.users.check(&LimiterKey::user(user_id))
    }

    /// Rate limit a call to `method` by client address.
    pub fn check_method(&self, method: &str, addr: &str) -> Decision {
        self.methods.check(method, LimiterKey::client(addr).as_str())
    }

    /// Enforce the organization's quota and consume from it.
    ///
    /// Requests without an organization context (`None` or a blank id) are
    /// not subject to organization limits and yield `None`.
    pub async fn check_organization(&self, org_id: Option<&str>) -> Option<Decision> {
        let org_id = org_id.map(str::trim).filter(|id| !id.is_empty());
        match org_id {
            Some(org_id) => Some(self.organizations.check_and_consume(org_id).await),
            None => {
                trace!("No organization context, skipping organization limits");
                None
            }
        }
    }

    pub fn config(&self) -> &TurnstileConfig {
        &self.config
    }

    pub fn clients(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.clients
    }

    pub fn users(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.users
    }

    pub fn methods(&self) -> &MethodLimiter {
        &self.methods
    }

    pub fn organizations(&self) -> &QuotaGatedLimiter {
        &self.organizations
    }

    pub fn adaptive(&self) -> &AdaptiveLimiter {
        &self.adaptive
    }

    pub fn breaker(&self) -> &CircuitBreakerLimiter {
        &self.breaker
    }

    pub fn invitations(&self) -> &Arc<InvitationLimiter> {
        &self.invitations
    }

    /// A sweeper over every registry, not yet started.
    pub fn sweeper(&self) -> IdleSweeper {
        IdleSweeper::new(self.config.sweeper.interval())
            .with_target(self.clients.clone())
            .with_target(self.users.clone())
            .with_target(self.methods.registry().clone())
            .with_target(self.organizations.registry().clone())
            .with_target(self.adaptive.registry().clone())
            .with_target(self.breaker.registry().clone())
            .with_target(self.invitations.clone())
    }

    /// Start sweeping idle entries in the background.
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.sweeper().start()
    }
}
