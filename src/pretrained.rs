//! Overwriting freshly initialized parameters with externally supplied ones.
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tch::{nn, Tensor};

use crate::config::WeightSources;
use crate::error::{Error, Result};

/// Resolves a weight locator into named tensors.
pub trait WeightLoader {
    fn fetch(&self, locator: &str) -> Result<Vec<(String, Tensor)>>;
}

/// Treats locators as file paths, optionally relative to `root`.
/// `.safetensors` files are read as such, anything else as a libtorch
/// multi-tensor archive (`.ot`).
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    root: Option<PathBuf>,
}

impl FileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(locator),
            None => PathBuf::from(locator),
        }
    }
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "safetensors")
}

impl WeightLoader for FileLoader {
    fn fetch(&self, locator: &str) -> Result<Vec<(String, Tensor)>> {
        let path = self.resolve(locator);
        if !path.is_file() {
            return Err(Error::MissingResource(path.display().to_string()));
        }
        let named = if is_safetensors(&path) {
            Tensor::read_safetensors(&path)?
        } else {
            Tensor::load_multi(&path)?
        };
        Ok(named)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub copied: usize,
    /// Names present in both places whose shapes disagree; left untouched.
    pub mismatched: Vec<String>,
    /// Supplied tensors with no counterpart in the model.
    pub unknown: usize,
    /// Model parameters nothing was supplied for.
    pub untouched: usize,
}

impl fmt::Display for LoadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} copied, {} shape mismatches, {} unknown, {} untouched",
            self.copied,
            self.mismatched.len(),
            self.unknown,
            self.untouched
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadReport {
    Loaded(LoadStats),
    /// Nothing was copied; the model keeps its random initialization.
    Unavailable(String),
}

/// Copies every supplied tensor whose name and shape match a variable of
/// `vs`. Mismatched shapes are skipped. A missing locator or a failing
/// fetch is reported, never propagated.
pub fn apply(
    vs: &nn::VarStore,
    arch: &str,
    sources: &WeightSources,
    loader: &dyn WeightLoader,
) -> LoadReport {
    let Some(locator) = sources.locator(arch) else {
        return LoadReport::Unavailable(format!("no weight source configured for {arch}"));
    };
    let named = match loader.fetch(locator) {
        Ok(named) => named,
        Err(err) => return LoadReport::Unavailable(format!("{locator}: {err}")),
    };
    match copy_matching(vs, named) {
        Ok(stats) => LoadReport::Loaded(stats),
        Err(err) => LoadReport::Unavailable(format!("{locator}: {err}")),
    }
}

fn copy_matching(vs: &nn::VarStore, named: Vec<(String, Tensor)>) -> Result<LoadStats> {
    let mut variables = vs.variables();
    let total = variables.len();
    let mut stats = LoadStats::default();
    let mut copied = HashSet::new();
    tch::no_grad(|| -> Result<()> {
        for (name, src) in named {
            match variables.get_mut(&name) {
                Some(_) if copied.contains(&name) => {
                    warn!("ignoring repeated tensor {name}");
                }
                Some(var) if var.size() == src.size() => {
                    var.f_copy_(&src)?;
                    copied.insert(name);
                }
                Some(var) => {
                    warn!(
                        "skipping {name}: expected {:?}, got {:?}",
                        var.size(),
                        src.size()
                    );
                    stats.mismatched.push(name);
                }
                None => {
                    debug!("ignoring unknown tensor {name}");
                    stats.unknown += 1;
                }
            }
        }
        Ok(())
    })?;
    stats.copied = copied.len();
    stats.untouched = total.saturating_sub(stats.copied);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    struct Fixed(Vec<(&'static str, Tensor)>);

    impl WeightLoader for Fixed {
        fn fetch(&self, _locator: &str) -> Result<Vec<(String, Tensor)>> {
            Ok(self
                .0
                .iter()
                .map(|(name, t)| (name.to_string(), t.shallow_clone()))
                .collect())
        }
    }

    struct Offline;

    impl WeightLoader for Offline {
        fn fetch(&self, locator: &str) -> Result<Vec<(String, Tensor)>> {
            Err(Error::MissingResource(locator.to_string()))
        }
    }

    fn store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _a = root.zeros("a", &[2, 3]);
        let _b = root.zeros("b", &[4]);
        vs
    }

    #[test]
    fn copies_matching_and_skips_the_rest() {
        let vs = store();
        let sources = WeightSources::new().with("net", "anywhere");
        let loader = Fixed(vec![
            ("a", Tensor::ones([2, 3], (Kind::Float, Device::Cpu))),
            ("b", Tensor::ones([5], (Kind::Float, Device::Cpu))),
            ("c", Tensor::ones([1], (Kind::Float, Device::Cpu))),
        ]);
        let report = apply(&vs, "net", &sources, &loader);
        assert_eq!(
            report,
            LoadReport::Loaded(LoadStats {
                copied: 1,
                mismatched: vec!["b".to_string()],
                unknown: 1,
                untouched: 1,
            })
        );
        let vars = vs.variables();
        assert!(vars["a"].equal(&Tensor::ones([2, 3], (Kind::Float, Device::Cpu))));
        assert!(vars["b"].equal(&Tensor::zeros([4], (Kind::Float, Device::Cpu))));
    }

    #[test]
    fn repeated_names_count_once() {
        let vs = store();
        let sources = WeightSources::new().with("net", "anywhere");
        let loader = Fixed(vec![
            ("b", Tensor::ones([4], (Kind::Float, Device::Cpu))),
            ("b", Tensor::full([4], 2.0, (Kind::Float, Device::Cpu))),
        ]);
        let report = apply(&vs, "net", &sources, &loader);
        assert_eq!(
            report,
            LoadReport::Loaded(LoadStats {
                copied: 1,
                mismatched: vec![],
                unknown: 0,
                untouched: 1,
            })
        );
        // first occurrence wins
        assert!(vs.variables()["b"].equal(&Tensor::ones([4], (Kind::Float, Device::Cpu))));
    }

    #[test]
    fn unavailable_weights_degrade() {
        let vs = store();
        let sources = WeightSources::new().with("net", "https://example.invalid/net.ot");
        assert!(matches!(
            apply(&vs, "net", &sources, &Offline),
            LoadReport::Unavailable(_)
        ));
        assert!(matches!(
            apply(&vs, "other", &sources, &Offline),
            LoadReport::Unavailable(_)
        ));
        assert!(vs.variables()["a"].equal(&Tensor::zeros([2, 3], (Kind::Float, Device::Cpu))));
    }

    #[test]
    fn file_loader_reads_archives() {
        let dir = tempfile::tempdir().unwrap();
        let ones = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
        Tensor::save_multi(&[("a", &ones)], dir.path().join("w.ot")).unwrap();

        let loader = FileLoader::new(dir.path());
        let named = loader.fetch("w.ot").unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].0, "a");
        assert!(named[0].1.equal(&ones));

        assert!(matches!(
            loader.fetch("missing.ot"),
            Err(Error::MissingResource(_))
        ));
    }
}
