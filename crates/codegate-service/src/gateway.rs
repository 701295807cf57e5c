//! Centralized request flow for protected actions.
//!
//! Every transport calls through here so validation, the authentication
//! requirement, quota accounting and generator startup happen in the same
//! order everywhere:
//!
//! validate input -> require principal -> quota gate -> start generator ->
//! pull first event.
//!
//! Nothing after the gate refunds quota. An admitted attempt is charged even
//! if the generator then fails.

use crate::ServiceState;
use crate::error::ServiceError;
use crate::gate::{Admission, Grant, QuotaUsage};
use crate::generator::GenerationInput;
use crate::policy::Action;
use crate::principal::Principal;
use crate::relay::RelayStream;

/// An admitted, started stream.
pub struct AdmittedStream {
    /// Tightest passed check.
    pub grant: Grant,
    pub stream: RelayStream,
}

/// Stateless method collection; all state is borrowed from `ServiceState`.
pub struct GatewayService;

impl GatewayService {
    /// Runs `action` for `principal` and returns the live stream.
    pub async fn stream(
        state: &ServiceState,
        principal: &Principal,
        action: Action,
        input: GenerationInput,
    ) -> Result<AdmittedStream, ServiceError> {
        input
            .validate()
            .map_err(|field| ServiceError::bad_request(format!("{field} is required")))?;

        let generator = state.generators().for_action(action).ok_or_else(|| {
            ServiceError::Internal(format!("no generator serves {action}"))
        })?;

        let grant = Self::admit(state, principal, action).await?;

        let seq = match generator.start(&input, &generator.default_options()).await {
            Ok(seq) => seq,
            Err(e) => {
                state.metrics().record_upstream_failure();
                tracing::error!(
                    %action,
                    generator = generator.name(),
                    error = %e,
                    "Generator failed to start"
                );
                return Err(ServiceError::UpstreamUnavailable(e.to_string()));
            }
        };

        let stream = state.relay().open(seq, action).await?;
        Ok(AdmittedStream { grant, stream })
    }

    /// Enforces the authentication requirement and runs the quota gate.
    ///
    /// Returns the tightest passed check. Used directly for actions with no
    /// generator, such as file creation.
    pub async fn admit(
        state: &ServiceState,
        principal: &Principal,
        action: Action,
    ) -> Result<Grant, ServiceError> {
        if action.requires_authentication() && !principal.is_authenticated() {
            tracing::debug!(%action, principal = %principal.id, "Guest refused");
            return Err(ServiceError::Unauthorized);
        }

        let admission = state.gate().admit(principal, action).await.map_err(|e| {
            tracing::error!(%action, error = %e, "Quota ledger failure");
            ServiceError::Ledger(e)
        })?;

        match admission {
            Admission::Admitted { ref grants } => {
                for grant in grants {
                    state.metrics().record_admission(grant.resource_class);
                }
                admission
                    .tightest()
                    .copied()
                    .ok_or_else(|| ServiceError::Internal(format!("{action} declares no checks")))
            }
            Admission::Rejected {
                resource_class,
                retry_after_secs,
                ..
            } => {
                state.metrics().record_rejection(resource_class);
                Err(ServiceError::QuotaExceeded {
                    resource_class,
                    retry_after_secs,
                })
            }
        }
    }

    /// Read-only usage snapshot for `principal`.
    pub async fn usage(
        state: &ServiceState,
        principal: &Principal,
    ) -> Result<Vec<QuotaUsage>, ServiceError> {
        Ok(state.gate().usage(principal).await?)
    }
}
