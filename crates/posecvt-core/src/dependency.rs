//! On-demand installation of optional converter libraries.
//!
//! The resolver is the only component allowed to change the environment
//! outside the artifact stores. Each library gets at most one install attempt
//! per process; a failed attempt is remembered and reported again without
//! rerunning the installer.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::{ConvertError, Result};

/// An optional library a strategy imports at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// Name passed to `import`.
    pub module: String,
    /// Requirement passed to the installer.
    pub package: String,
}

impl Dependency {
    pub fn new(module: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            package: package.into(),
        }
    }

    /// A dependency whose import and package names coincide.
    pub fn named(name: &str) -> Self {
        Self::new(name, name)
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.module)
    }
}

/// Makes dependencies importable.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Succeeds once `dependency` is importable, installing it if needed.
    async fn ensure(&self, dependency: &Dependency) -> Result<()>;

    /// [`DependencyResolver::ensure`] reduced to a yes/no answer.
    async fn is_available(&self, dependency: &Dependency) -> bool {
        self.ensure(dependency).await.is_ok()
    }

    /// Resolve several dependencies in order, stopping at the first failure.
    async fn ensure_all(&self, dependencies: &[Dependency]) -> Result<()> {
        for dependency in dependencies {
            self.ensure(dependency).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum InstallAttempt {
    Installed,
    Failed(String),
}

/// Resolver backed by a Python interpreter and `pip`.
pub struct PipResolver {
    python: String,
    install_timeout: Duration,
    attempts: Mutex<HashMap<String, InstallAttempt>>,
}

impl PipResolver {
    pub fn new(python: impl Into<String>, install_timeout: Duration) -> Self {
        Self {
            python: python.into(),
            install_timeout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    async fn is_importable(&self, module: &str) -> Result<bool> {
        let probe = Command::new(&self.python)
            .args(["-c", &format!("import {module}")])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(TimeoutConfig::IMPORT_CHECK, probe).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    debug!(
                        "import {} failed: {}",
                        module,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Ok(output.status.success())
            }
            Ok(Err(e)) => Err(ConvertError::DependencyUnavailable {
                library: module.to_string(),
                diagnostic: format!("failed to run {}: {e}", self.python),
            }),
            Err(_) => Err(ConvertError::ConversionTimeout {
                operation: format!("import check for {module}"),
                timeout: TimeoutConfig::IMPORT_CHECK,
            }),
        }
    }

    async fn pip_install(&self, package: &str) -> std::result::Result<(), PipFailure> {
        info!("Installing {} with pip...", package);
        let install = Command::new(&self.python)
            .args(["-m", "pip", "install", "-q", package])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.install_timeout, install).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(PipFailure::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Ok(Err(e)) => Err(PipFailure::Failed(format!("failed to run pip: {e}"))),
            Err(_) => Err(PipFailure::TimedOut),
        }
    }
}

enum PipFailure {
    Failed(String),
    TimedOut,
}

#[async_trait]
impl DependencyResolver for PipResolver {
    async fn ensure(&self, dependency: &Dependency) -> Result<()> {
        validate_module_name(&dependency.module)?;

        // Held across the install so concurrent callers cannot double-install.
        let mut attempts = self.attempts.lock().await;
        match attempts.get(&dependency.module) {
            Some(InstallAttempt::Installed) => return Ok(()),
            Some(InstallAttempt::Failed(diagnostic)) => {
                return Err(ConvertError::DependencyUnavailable {
                    library: dependency.module.clone(),
                    diagnostic: diagnostic.clone(),
                });
            }
            None => {}
        }

        if self.is_importable(&dependency.module).await? {
            debug!("{} is importable", dependency.module);
            return Ok(());
        }

        let outcome = match self.pip_install(&dependency.package).await {
            Ok(()) => {
                if self.is_importable(&dependency.module).await.unwrap_or(false) {
                    InstallAttempt::Installed
                } else {
                    InstallAttempt::Failed(format!(
                        "{} installed but `import {}` still fails",
                        dependency.package, dependency.module
                    ))
                }
            }
            Err(PipFailure::Failed(stderr)) => InstallAttempt::Failed(stderr),
            Err(PipFailure::TimedOut) => {
                attempts.insert(
                    dependency.module.clone(),
                    InstallAttempt::Failed(format!(
                        "pip install {} timed out after {:?}",
                        dependency.package, self.install_timeout
                    )),
                );
                return Err(ConvertError::ConversionTimeout {
                    operation: format!("pip install {}", dependency.package),
                    timeout: self.install_timeout,
                });
            }
        };

        attempts.insert(dependency.module.clone(), outcome.clone());
        match outcome {
            InstallAttempt::Installed => {
                info!("Installed {}", dependency.package);
                Ok(())
            }
            InstallAttempt::Failed(diagnostic) => {
                warn!("Could not install {}: {}", dependency.package, diagnostic);
                Err(ConvertError::DependencyUnavailable {
                    library: dependency.module.clone(),
                    diagnostic,
                })
            }
        }
    }
}

/// Module names are interpolated into `python -c`, so only dotted identifiers pass.
fn validate_module_name(module: &str) -> Result<()> {
    let valid = !module.is_empty()
        && module.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(ConvertError::Validation {
            field: "module".into(),
            message: format!("'{module}' is not a valid Python module name"),
        })
    }
}
