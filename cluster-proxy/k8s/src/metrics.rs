use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts certificate reconciliations by result.
#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    reconciles: Family<ResultLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    result: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ResultLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of certificate reconciliations by result",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    pub(crate) fn ok(&self) {
        self.inc("ok");
    }

    pub(crate) fn error(&self) {
        self.inc("error");
    }

    /// Another replica holds the lease.
    pub(crate) fn skipped(&self) {
        self.inc("skipped");
    }

    fn inc(&self, result: &'static str) {
        self.reconciles.get_or_create(&ResultLabels { result }).inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, result: &'static str) -> u64 {
        self.reconciles.get_or_create(&ResultLabels { result }).get()
    }
}
