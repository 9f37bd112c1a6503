//! Execution context shared by all operators.

use std::sync::{Arc, OnceLock};

use kiln_core::{Device, KilnError, Result};

use crate::config::{KernelConfig, LinalgBackend};
use crate::linalg::{FactorizationService, HostFactorization};
use crate::linear::{CpuMatmulFusion, MatmulFusion};
use crate::runtime::{Queue, QueueRegistry};

static GLOBAL: OnceLock<Context> = OnceLock::new();

/// Configuration, device queues and pluggable services for one caller.
///
/// ```
/// use kiln_kernels::{Context, KernelConfig};
///
/// let mut config = KernelConfig::default();
/// config.cat.batch_size = 16;
/// let ctx = Context::new(config).unwrap();
/// assert_eq!(ctx.config().cat.batch_size, 16);
/// ```
pub struct Context {
    config: KernelConfig,
    queues: QueueRegistry,
    matmul: Arc<dyn MatmulFusion>,
    factorization: Option<Arc<dyn FactorizationService>>,
}

impl Context {
    /// Build a context after validating `config`.
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: KernelConfig) -> Self {
        let factorization: Option<Arc<dyn FactorizationService>> = match config.linalg.backend {
            LinalgBackend::Host => Some(Arc::new(HostFactorization::default())),
            LinalgBackend::None => None,
        };
        Self {
            queues: QueueRegistry::new(&config.runtime),
            matmul: Arc::new(CpuMatmulFusion::new(config.linear.clone())),
            factorization,
            config,
        }
    }

    /// Process-wide default context, configured from `KILN_*` variables.
    ///
    /// Invalid overrides are logged and ignored.
    pub fn global() -> &'static Context {
        GLOBAL.get_or_init(|| {
            let config = KernelConfig::default()
                .with_env_overrides()
                .unwrap_or_else(|err| {
                    tracing::warn!(%err, "ignoring invalid KILN_* overrides");
                    KernelConfig::default()
                });
            Context::build(config)
        })
    }

    /// Replace the fused-matmul service.
    pub fn with_matmul_fusion(mut self, service: Arc<dyn MatmulFusion>) -> Self {
        self.matmul = service;
        self
    }

    /// Replace (or remove) the factorization service.
    pub fn with_factorization(mut self, service: Option<Arc<dyn FactorizationService>>) -> Self {
        self.factorization = service;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Current queue for `device`.
    pub fn queue(&self, device: Device) -> Arc<Queue> {
        self.queues.get(device)
    }

    pub fn matmul_fusion(&self) -> &dyn MatmulFusion {
        self.matmul.as_ref()
    }

    /// The factorization service, or `Unsupported` when none is configured.
    pub fn factorization(&self) -> Result<&dyn FactorizationService> {
        self.factorization.as_deref().ok_or_else(|| {
            KilnError::Unsupported("no linear algebra backend is available".into())
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("queues", &self.queues.len())
            .field("factorization", &self.factorization.is_some())
            .finish()
    }
}
