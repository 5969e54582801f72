//! Module Manager: ensures kernel modules are loaded with the required
//! parameters.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use nicprep_common::types::{normalize_module_name, param_values_match};
use nicprep_common::{HostPrepError, HostPrepResult, ModuleSpec, ResourceStore};

use crate::journal::JournalEntry;

/// Module whose parameter enables passthrough without an IOMMU.
pub const VFIO_MODULE: &str = "vfio";

/// Parameter of [`VFIO_MODULE`] that enables no-IOMMU mode.
pub const NOIOMMU_PARAM: &str = "enable_unsafe_noiommu_mode";

/// Modules a target driver needs, in load order.
pub fn required_modules(target_driver: &str, no_iommu: bool) -> Vec<ModuleSpec> {
    match normalize_module_name(target_driver).as_str() {
        "vfio_pci" => {
            let mut vfio = ModuleSpec::new(VFIO_MODULE);
            if no_iommu {
                vfio = vfio.with_parameter(NOIOMMU_PARAM, "1");
            }
            vec![vfio, ModuleSpec::new(target_driver)]
        }
        "uio_pci_generic" | "igb_uio" => {
            vec![ModuleSpec::new("uio"), ModuleSpec::new(target_driver)]
        }
        _ => vec![ModuleSpec::new(target_driver)],
    }
}

/// Loads kernel modules idempotently.
pub struct ModuleMgr {
    store: Arc<dyn ResourceStore>,
}

impl ModuleMgr {
    /// Creates a module manager over `store`.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Loads `spec` if it is not loaded.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - Already loaded with matching parameters
    /// * `Ok(Some(entry))` - Loaded by this call
    /// * `Err(ModuleParamConflict)` - Loaded with different parameters
    /// * `Err(ModuleLoadFailed)` - modprobe failed or the module did not appear
    #[instrument(skip(self), fields(module = %spec.name))]
    pub async fn ensure_loaded(&self, spec: &ModuleSpec) -> HostPrepResult<Option<JournalEntry>> {
        let state = self.store.module_state(&spec.name).await?;

        if state.loaded {
            for (param, expected) in &spec.parameters {
                let actual = state.parameters.get(param);
                if !actual.is_some_and(|a| param_values_match(expected, a)) {
                    return Err(HostPrepError::ModuleParamConflict {
                        module: state.name.clone(),
                        parameter: param.clone(),
                        expected: expected.clone(),
                        actual: actual.cloned().unwrap_or_else(|| "unknown".to_string()),
                    });
                }
            }
            debug!("Module already loaded");
            return Ok(None);
        }

        self.store
            .load_module(spec)
            .await
            .map_err(|e| HostPrepError::ModuleLoadFailed {
                module: spec.name.clone(),
                reason: e.to_string(),
            })?;

        let after = self.store.module_state(&spec.name).await?;
        if !after.loaded {
            return Err(HostPrepError::ModuleLoadFailed {
                module: spec.name.clone(),
                reason: "module not present after modprobe".to_string(),
            });
        }

        info!(%spec, "Loaded module");
        Ok(Some(JournalEntry::ModuleLoaded {
            module: spec.name.clone(),
        }))
    }

    /// Unloads a module this tool loaded.
    #[instrument(skip(self))]
    pub async fn unload(&self, module: &str) -> HostPrepResult<()> {
        self.store.unload_module(module).await?;
        info!("Unloaded module");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicprep_test::fixtures::e1000_host;
    use nicprep_test::FakeHost;
    use pretty_assertions::assert_eq;

    fn mgr(host: &FakeHost) -> ModuleMgr {
        ModuleMgr::new(Arc::new(host.clone()))
    }

    #[test]
    fn test_required_modules() {
        let names = |specs: Vec<ModuleSpec>| -> Vec<String> {
            specs.iter().map(ToString::to_string).collect()
        };
        assert_eq!(
            names(required_modules("vfio-pci", true)),
            vec!["vfio enable_unsafe_noiommu_mode=1", "vfio-pci"]
        );
        assert_eq!(names(required_modules("vfio-pci", false)), vec!["vfio", "vfio-pci"]);
        assert_eq!(
            names(required_modules("uio_pci_generic", false)),
            vec!["uio", "uio_pci_generic"]
        );
        assert_eq!(names(required_modules("mlx5_core", true)), vec!["mlx5_core"]);
    }

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        let host = e1000_host();
        let spec = ModuleSpec::new("vfio-pci");

        let first = mgr(&host).ensure_loaded(&spec).await.unwrap();
        assert_eq!(
            first,
            Some(JournalEntry::ModuleLoaded {
                module: "vfio-pci".to_string()
            })
        );
        let second = mgr(&host).ensure_loaded(&spec).await.unwrap();
        assert_eq!(second, None);
        assert_eq!(host.mutations(), vec!["modprobe vfio-pci".to_string()]);
    }

    #[tokio::test]
    async fn test_param_conflict_is_surfaced() {
        let host = e1000_host().with_loaded_module("vfio", &[(NOIOMMU_PARAM, "N")]);
        let spec = ModuleSpec::new("vfio").with_parameter(NOIOMMU_PARAM, "1");

        let err = mgr(&host).ensure_loaded(&spec).await.unwrap_err();
        match err {
            HostPrepError::ModuleParamConflict {
                module,
                parameter,
                expected,
                actual,
            } => {
                assert_eq!(module, "vfio");
                assert_eq!(parameter, NOIOMMU_PARAM);
                assert_eq!(expected, "1");
                assert_eq!(actual, "N");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(host.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_matching_params_are_a_noop() {
        let host = e1000_host().with_loaded_module("vfio", &[(NOIOMMU_PARAM, "Y")]);
        let spec = ModuleSpec::new("vfio").with_parameter(NOIOMMU_PARAM, "1");
        assert_eq!(mgr(&host).ensure_loaded(&spec).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_failure() {
        let host = e1000_host().fail_module_load("vfio");
        let err = mgr(&host)
            .ensure_loaded(&ModuleSpec::new("vfio"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HostPrepError::ModuleLoadFailed { ref module, .. } if module == "vfio"
        ));
        assert!(!host.is_module_loaded("vfio"));
    }

    #[tokio::test]
    async fn test_unload() {
        let host = e1000_host();
        let m = mgr(&host);
        m.ensure_loaded(&ModuleSpec::new("uio")).await.unwrap();
        m.unload("uio").await.unwrap();
        assert!(!host.is_module_loaded("uio"));
        assert!(m.unload("uio").await.is_err());
    }
}
