use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts forwarded requests by routing mode and outcome.
#[derive(Clone, Debug, Default)]
pub struct ProxyMetrics {
    requests: Family<RequestLabels, Counter>,
    dial_failures: Family<ModeLabels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The request did not resolve to a target.
    Unresolved,
    ApiServer,
    Service,
    Relay,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    InvalidTarget,
    DialFailed,
    ForwardFailed,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    mode: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ModeLabels {
    mode: &'static str,
}

// === impl ProxyMetrics ===

impl ProxyMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of proxied requests by outcome",
            requests.clone(),
        );

        let dial_failures = Family::<ModeLabels, Counter>::default();
        reg.register(
            "dial_failures",
            "Total number of tunnel dials that failed",
            dial_failures.clone(),
        );

        Self {
            requests,
            dial_failures,
        }
    }

    pub(crate) fn request(&self, mode: Mode, outcome: Outcome) {
        self.requests
            .get_or_create(&RequestLabels {
                mode: mode.as_str(),
                outcome: outcome.as_str(),
            })
            .inc();
        if outcome == Outcome::DialFailed {
            self.dial_failures
                .get_or_create(&ModeLabels {
                    mode: mode.as_str(),
                })
                .inc();
        }
    }
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::ApiServer => "apiserver",
            Self::Service => "service",
            Self::Relay => "relay",
        }
    }
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::InvalidTarget => "invalid_target",
            Self::DialFailed => "dial_failed",
            Self::ForwardFailed => "forward_failed",
        }
    }
}
