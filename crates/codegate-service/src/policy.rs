//! Window policy: per resource class and principal class limits.
//!
//! Each protected [`Action`] declares an ordered list of
//! `(ledger, resource class)` pairs. The policy resolves those into concrete
//! [`QuotaCheck`]s for a given principal class.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::principal::PrincipalClass;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Longest window a policy may declare (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * DAY;

/// Named category of protected action subject to its own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub enum ResourceClass {
    /// Hourly AI assistant quota.
    AiAssistant,
    /// Daily AI request quota, shared by assistant calls.
    AiDaily,
    CodeSuggestion,
    CodeConversion,
    FileCreation,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 5] = [
        Self::AiAssistant,
        Self::AiDaily,
        Self::CodeSuggestion,
        Self::CodeConversion,
        Self::FileCreation,
    ];

    /// Wire name, as used in JSON bodies and policy files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiAssistant => "aiAssistant",
            Self::AiDaily => "aiDaily",
            Self::CodeSuggestion => "codeSuggestion",
            Self::CodeConversion => "codeConversion",
            Self::FileCreation => "fileCreation",
        }
    }

    /// Label used for ledger keys and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::AiAssistant => "ai_assistant",
            Self::AiDaily => "ai_daily",
            Self::CodeSuggestion => "code_suggestion",
            Self::CodeConversion => "code_conversion",
            Self::FileCreation => "file_creation",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which counter store a check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub enum LedgerKind {
    Volatile,
    Durable,
}

/// A limit over a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub limit: u64,
    pub window_seconds: u64,
}

impl Window {
    pub const fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }
}

/// Windows for both principal classes of one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ClassWindows {
    pub authenticated: Window,
    pub guest: Window,
}

/// Protected actions exposed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    AiAssistant,
    CodeSuggestion,
    CodeConversion,
    FileCreation,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Self::AiAssistant,
        Self::CodeSuggestion,
        Self::CodeConversion,
        Self::FileCreation,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::AiAssistant => "ai_assistant",
            Self::CodeSuggestion => "code_suggestion",
            Self::CodeConversion => "code_conversion",
            Self::FileCreation => "file_creation",
        }
    }

    /// Whether a guest principal is turned away before any ledger is touched.
    pub fn requires_authentication(self) -> bool {
        !matches!(self, Self::CodeSuggestion)
    }

    /// Ordered checks that must all pass for this action.
    pub fn declared_checks(self) -> &'static [(LedgerKind, ResourceClass)] {
        match self {
            Self::AiAssistant => &[
                (LedgerKind::Volatile, ResourceClass::AiAssistant),
                (LedgerKind::Volatile, ResourceClass::AiDaily),
            ],
            Self::CodeSuggestion => &[(LedgerKind::Volatile, ResourceClass::CodeSuggestion)],
            Self::CodeConversion => &[
                (LedgerKind::Volatile, ResourceClass::CodeConversion),
                (LedgerKind::Durable, ResourceClass::CodeConversion),
            ],
            Self::FileCreation => &[(LedgerKind::Durable, ResourceClass::FileCreation)],
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One resolved check: which ledger, which class, what limit and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub ledger: LedgerKind,
    pub resource_class: ResourceClass,
    pub limit: u64,
    pub window_secs: u64,
}

/// Invalid policy configuration.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid policy file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}: window must be longer than zero seconds")]
    ZeroWindow(ResourceClass),

    #[error("{0}: window must not exceed {MAX_WINDOW_SECS} seconds")]
    WindowTooLong(ResourceClass),

    #[error("{0}: guest limit must be strictly below the authenticated limit")]
    GuestNotBelowAuthenticated(ResourceClass),
}

/// Static table of `(resourceClass, principalClass) -> Window`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowPolicy {
    classes: BTreeMap<ResourceClass, ClassWindows>,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        let classes = BTreeMap::from([
            (
                ResourceClass::AiAssistant,
                ClassWindows {
                    authenticated: Window::new(10, HOUR),
                    guest: Window::new(0, HOUR),
                },
            ),
            (
                ResourceClass::AiDaily,
                ClassWindows {
                    authenticated: Window::new(30, DAY),
                    guest: Window::new(0, DAY),
                },
            ),
            (
                ResourceClass::CodeSuggestion,
                ClassWindows {
                    authenticated: Window::new(60, 60),
                    guest: Window::new(20, 60),
                },
            ),
            (
                ResourceClass::CodeConversion,
                ClassWindows {
                    authenticated: Window::new(5, DAY),
                    guest: Window::new(0, DAY),
                },
            ),
            (
                ResourceClass::FileCreation,
                ClassWindows {
                    authenticated: Window::new(5, 30 * DAY),
                    guest: Window::new(0, 30 * DAY),
                },
            ),
        ]);
        Self { classes }
    }
}

impl WindowPolicy {
    /// Builds the default policy with the given entries replaced.
    pub fn with_overrides(
        overrides: impl IntoIterator<Item = (ResourceClass, ClassWindows)>,
    ) -> Result<Self, PolicyError> {
        let mut policy = Self::default();
        policy.classes.extend(overrides);
        policy.validate()?;
        Ok(policy)
    }

    /// Parses a JSON policy file. Classes not mentioned keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let overrides: BTreeMap<ResourceClass, ClassWindows> = serde_json::from_str(json)?;
        Self::with_overrides(overrides)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for (class, windows) in &self.classes {
            if windows.authenticated.window_seconds == 0 || windows.guest.window_seconds == 0 {
                return Err(PolicyError::ZeroWindow(*class));
            }
            if windows.authenticated.window_seconds > MAX_WINDOW_SECS
                || windows.guest.window_seconds > MAX_WINDOW_SECS
            {
                return Err(PolicyError::WindowTooLong(*class));
            }
            if windows.guest.limit >= windows.authenticated.limit {
                return Err(PolicyError::GuestNotBelowAuthenticated(*class));
            }
        }
        Ok(())
    }

    pub fn lookup(&self, class: ResourceClass, principal: PrincipalClass) -> Window {
        let windows = self.windows(class);
        match principal {
            PrincipalClass::Authenticated => windows.authenticated,
            PrincipalClass::Guest => windows.guest,
        }
    }

    pub fn windows(&self, class: ResourceClass) -> ClassWindows {
        // Every class is seeded by `Default`, and overrides only replace entries.
        self.classes
            .get(&class)
            .copied()
            .unwrap_or_else(|| Self::default().classes[&class])
    }

    /// Resolves an action's declared checks for a principal class.
    pub fn checks_for(&self, action: Action, principal: PrincipalClass) -> Vec<QuotaCheck> {
        action
            .declared_checks()
            .iter()
            .map(|&(ledger, resource_class)| {
                let window = self.lookup(resource_class, principal);
                QuotaCheck {
                    ledger,
                    resource_class,
                    limit: window.limit,
                    window_secs: window.window_seconds,
                }
            })
            .collect()
    }
}
