//! Run configuration.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

/// Configuration for one reconciliation run.
///
/// The harness supplies the seed (the run's randomness source) and decides
/// the recovery mode; everything else has defaults matching a typical
/// disaster-recovery exercise.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Size of the tenant name space (`tenant00000000`..)
    pub max_tenants: usize,

    /// Tenants created before any backup starts
    pub initial_tenants: usize,

    /// Size of the tenant group name space (`tenantgroup00000000`..)
    pub max_tenant_groups: usize,

    /// Whether the management directory is wiped and rebuilt
    pub recover_management_cluster: bool,

    /// Whether a subset of data clusters is restored from backup
    pub recover_data_clusters: bool,

    /// How long foreground mutations keep running after backups complete
    pub mutation_window: Duration,

    /// Probability that a foreground directory operation fails with a
    /// transient conflict (exercises the retry path; 0 disables)
    pub conflict_probability: f64,

    /// Seed for every random decision in the run
    pub seed: u64,
}

impl RunConfig {
    pub fn new(seed: u64) -> Self {
        Self {
            max_tenants: 1000,
            initial_tenants: 40,
            max_tenant_groups: 20,
            recover_management_cluster: true,
            recover_data_clusters: true,
            mutation_window: Duration::from_secs(30),
            conflict_probability: 0.0,
            seed,
        }
    }

    /// Draw the recovery mode the way the disaster simulation does: one of
    /// {both, management-only, data-only}, uniformly.
    pub fn random_mode(mut self, rng: &mut StdRng) -> Self {
        let mode = rng.gen_range(0..3);
        self.recover_management_cluster = mode != 2;
        self.recover_data_clusters = mode != 1;
        self
    }

    pub fn with_max_tenants(mut self, max_tenants: usize) -> Self {
        self.max_tenants = max_tenants.min(99_999_999);
        self.initial_tenants = self.initial_tenants.min(self.max_tenants);
        self.max_tenant_groups = self.max_tenant_groups.min(2 * self.max_tenants);
        self
    }

    pub fn with_initial_tenants(mut self, initial_tenants: usize) -> Self {
        self.initial_tenants = initial_tenants.min(self.max_tenants);
        self
    }

    pub fn with_max_tenant_groups(mut self, max_tenant_groups: usize) -> Self {
        self.max_tenant_groups = max_tenant_groups.min(2 * self.max_tenants);
        self
    }

    pub fn with_recovery(mut self, management: bool, data: bool) -> Self {
        self.recover_management_cluster = management;
        self.recover_data_clusters = data;
        self
    }

    pub fn with_mutation_window(mut self, window: Duration) -> Self {
        self.mutation_window = window;
        self
    }

    pub fn with_conflict_probability(mut self, probability: f64) -> Self {
        self.conflict_probability = probability;
        self
    }

    /// Initial per-cluster group capacity: spreads the initial tenants and
    /// their groups roughly evenly over the data clusters, leaving admission
    /// tight enough that the autoscale path gets exercised.
    pub fn initial_group_capacity(&self, cluster_count: usize) -> u32 {
        let units = self.initial_tenants / 2 + self.max_tenant_groups - 1;
        ((units / cluster_count.max(1)).max(1)) as u32
    }
}
