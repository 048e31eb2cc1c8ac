//! Deployment rules mapping actor paths to the node they are created on.
//!
//! Paths are relative to the user guardian, so the rule for `/blub` applies to the actor at `/user/blub`.
//! A path element of `*` matches any single element. When several rules match, the one with more elements
//! wins, and among equally deep rules the one with more exact elements wins.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{address::Address, error::ConfigError, path::split_elements};

const WILDCARD: &str = "*";

/// Where an actor is created.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// On this node.
    Local,
    /// On the node at the address.
    Remote(Address),
}

/// A deployment rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deploy {
    elements: Vec<String>,
    scope: Scope,
}

impl Deploy {
    /// Creates a rule for a path such as `/blub` or `/workers/*`.
    pub fn new(path: &str, scope: Scope) -> Result<Self, ConfigError> {
        let elements = split_elements(path)
            .filter(|elements| !elements.is_empty())
            .ok_or_else(|| ConfigError::InvalidDeploymentPath(path.to_string()))?;
        Ok(Deploy { elements, scope })
    }

    /// The rule path, e.g. `/blub`.
    pub fn path(&self) -> String {
        format!("/{}", self.elements.join("/"))
    }

    /// The path elements.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Where matching actors are created.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Scores how well the rule matches `elements`, or `None` if it does not apply.
    ///
    /// A rule applies to the path it names and to every descendant of it. Deeper rules score higher, then
    /// rules with more exact elements, then rules whose exact elements come first.
    fn score(&self, elements: &[impl AsRef<str>]) -> Option<(usize, usize, Vec<bool>)> {
        if self.elements.len() > elements.len() {
            return None;
        }
        let mut exact = Vec::with_capacity(self.elements.len());
        for (rule, element) in self.elements.iter().zip(elements) {
            if rule == element.as_ref() {
                exact.push(true);
            } else if rule == WILDCARD {
                exact.push(false);
            } else {
                return None;
            }
        }
        let matched = exact.iter().filter(|exact| **exact).count();
        Some((self.elements.len(), matched, exact))
    }
}

/// The table of deployment rules.
///
/// Cheap to clone; clones share the table. Rules are usually populated once at startup and only read
/// afterwards, but [`Deployer::set_deploy`] may be called at any time.
#[derive(Clone, Default)]
pub struct Deployer {
    deployments: Arc<RwLock<HashMap<Vec<String>, Deploy>>>,
}

impl Deployer {
    /// Creates an empty table.
    pub fn new() -> Self {
        Deployer::default()
    }

    /// Builds a table from flat configuration entries.
    ///
    /// Keys are a path followed by `.remote` or `.local`:
    ///
    /// - `/blub.remote = "test://remote-sys@localhost:12346"` deploys `/blub` on that node.
    /// - `/blub.local = ""`, or a `.remote` key with an empty or `local` value, keeps `/blub` on this node.
    ///
    /// ```
    /// use kameo_remoting::deployer::{Deployer, Scope};
    ///
    /// let deployer = Deployer::from_config([
    ///     ("/blub.remote", "test://remote-sys@localhost:12346"),
    ///     ("/looker/*.local", ""),
    /// ])
    /// .unwrap();
    /// assert!(matches!(deployer.lookup(&["blub"]).unwrap().scope(), Scope::Remote(_)));
    /// assert_eq!(deployer.lookup(&["looker", "a"]).unwrap().scope(), &Scope::Local);
    /// ```
    pub fn from_config<I, K, V>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let deployer = Deployer::new();
        for (key, value) in entries {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            let deploy = if let Some(path) = key.strip_suffix(".remote") {
                if value.is_empty() || value == "local" {
                    Deploy::new(path, Scope::Local)?
                } else {
                    Deploy::new(path, Scope::Remote(value.parse()?))?
                }
            } else if let Some(path) = key.strip_suffix(".local") {
                Deploy::new(path, Scope::Local)?
            } else {
                return Err(ConfigError::UnknownDeploymentKey(key.to_string()));
            };
            deployer.set_deploy(deploy);
        }
        Ok(deployer)
    }

    /// Inserts or replaces the rule for its path.
    pub fn set_deploy(&self, deploy: Deploy) {
        self.deployments
            .write()
            .insert(deploy.elements.clone(), deploy);
    }

    /// The best matching rule for the path elements below the user guardian.
    pub fn lookup(&self, elements: &[impl AsRef<str>]) -> Option<Deploy> {
        let deployments = self.deployments.read();
        if let Some(exact) = deployments.get(
            &elements
                .iter()
                .map(|element| element.as_ref().to_string())
                .collect::<Vec<_>>(),
        ) {
            return Some(exact.clone());
        }
        deployments
            .values()
            .filter_map(|deploy| deploy.score(elements).map(|score| (score, deploy)))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, deploy)| deploy.clone())
    }

    /// The best matching rule for a relative path such as `/blub`.
    pub fn lookup_path(&self, path: &str) -> Option<Deploy> {
        self.lookup(&split_elements(path)?)
    }

    /// The number of rules.
    pub fn len(&self) -> usize {
        self.deployments.read().len()
    }

    /// Returns `true` if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.deployments.read().is_empty()
    }
}

impl fmt::Debug for Deployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deployments = self.deployments.read();
        f.debug_list()
            .entries(deployments.values().map(|deploy| (deploy.path(), &deploy.scope)))
            .finish()
    }
}
