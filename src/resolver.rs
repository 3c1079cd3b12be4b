//! Dependency resolution.
//!
//! The resolver pools every package of every index into a provides map
//! (each package under its own name plus each of its `provides` tokens),
//! then expands the world constraints depth-first, choosing for each atom
//! the best candidate by a fixed preference order:
//!
//! 1. the already-installed package for that name,
//! 2. packages from the atom's pinned repository,
//! 3. higher provider priority,
//! 4. higher version,
//! 5. earlier index position,
//! 6. name.
//!
//! Packages living in a *named* (pinned) index are only candidates for
//! atoms pinned to that name — apk by default draws from untagged
//! repositories — with the installed set always eligible. The output plan
//! is dependency-first topological order; mutual cycles are emitted in
//! discovery order and reported to the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use crate::index::{NamedIndex, Package};
use crate::version::{Atom, Constraint, Version};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("nothing satisfies {atom} (required by {})", chain_text(.chain))]
    Unsatisfiable { atom: String, chain: Vec<String> },

    #[error("{name} conflicts with {conflicting} (required by {})", chain_text(.chain))]
    Conflict {
        name: String,
        conflicting: String,
        chain: Vec<String>,
    },

    #[error("no provider for {atom} in pinned repository {pin:?}")]
    PinViolation { atom: String, pin: String },
}

fn chain_text(chain: &[String]) -> String {
    if chain.is_empty() {
        "world".to_string()
    } else {
        chain.join(" -> ")
    }
}

/// The caller's constraints plus the packages that must be preserved.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub atoms: Vec<Atom>,
    pub installed: Vec<Package>,
}

impl World {
    pub fn from_names(names: &[&str]) -> Self {
        Self {
            atoms: names.iter().map(|n| Atom::parse(n)).collect(),
            installed: Vec::new(),
        }
    }
}

/// An ordered install plan.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Chosen packages, dependencies before dependents.
    pub packages: Vec<Arc<Package>>,
    /// Names involved in mutual dependency cycles, one entry per cycle.
    pub cycles: Vec<Vec<String>>,
}

#[derive(Clone)]
struct Candidate {
    pkg: Arc<Package>,
    /// Name of the index this candidate came from ("" when untagged).
    index_name: String,
    index_pos: usize,
    /// The version this candidate was entered under: its own version for
    /// the self entry, the `=version` of a provides token, `None` for a
    /// bare provides token (satisfies only unconstrained atoms).
    version: Option<Version>,
}

/// Priority-ordered candidate lookup over a set of indexes.
pub struct Resolver {
    providers: HashMap<String, Vec<Candidate>>,
    /// name -> version text of the installed package.
    installed: HashMap<String, String>,
}

impl Resolver {
    pub fn new(indexes: &[NamedIndex], world: &World) -> Self {
        let mut providers: HashMap<String, Vec<Candidate>> = HashMap::new();
        let mut add = |token: &str, cand: Candidate| {
            providers.entry(token.to_string()).or_default().push(cand);
        };

        for (pos, index) in indexes.iter().enumerate() {
            for pkg in &index.packages {
                add(
                    &pkg.name,
                    Candidate {
                        pkg: Arc::clone(pkg),
                        index_name: index.name.clone(),
                        index_pos: pos,
                        version: pkg.parsed_version(),
                    },
                );
                for token in &pkg.provides {
                    let (name, version) = split_provides(token);
                    add(
                        name,
                        Candidate {
                            pkg: Arc::clone(pkg),
                            index_name: index.name.clone(),
                            index_pos: pos,
                            version,
                        },
                    );
                }
            }
        }

        let installed = world
            .installed
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();

        Self {
            providers,
            installed,
        }
    }

    fn is_installed(&self, cand: &Candidate) -> bool {
        self.installed
            .get(&cand.pkg.name)
            .is_some_and(|v| *v == cand.pkg.version)
    }

    /// Candidates for an atom, filtered and sorted best-first.
    fn candidates(&self, atom: &Atom) -> Vec<Candidate> {
        let Some(pool) = self.providers.get(&atom.name) else {
            return Vec::new();
        };

        let mut found: Vec<Candidate> = pool
            .iter()
            .filter(|c| {
                // Tagged repositories only serve atoms carrying their tag;
                // installed packages stay eligible either way.
                let pin_ok = if atom.pin.is_empty() {
                    c.index_name.is_empty() || self.is_installed(c)
                } else {
                    c.index_name == atom.pin || self.is_installed(c)
                };
                if !pin_ok {
                    return false;
                }
                match atom.constraint {
                    Constraint::Any => true,
                    _ => c.version.as_ref().is_some_and(|v| atom.matches_version(v)),
                }
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| {
            self.is_installed(b)
                .cmp(&self.is_installed(a))
                .then_with(|| {
                    let a_pinned = !atom.pin.is_empty() && a.index_name == atom.pin;
                    let b_pinned = !atom.pin.is_empty() && b.index_name == atom.pin;
                    b_pinned.cmp(&a_pinned)
                })
                .then_with(|| b.pkg.provider_priority.cmp(&a.pkg.provider_priority))
                .then_with(|| match (&b.version, &a.version) {
                    (Some(bv), Some(av)) => bv.cmp(av),
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.index_pos.cmp(&b.index_pos))
                .then_with(|| a.pkg.name.cmp(&b.pkg.name))
        });
        found
    }

    /// Expand the world into an ordered plan.
    pub fn resolve(&self, world: &World) -> Result<Plan, ResolveError> {
        // token -> version under which the chosen package satisfies it
        let mut chosen_tokens: HashMap<String, (Arc<Package>, Option<Version>)> = HashMap::new();
        // real package names, in discovery order
        let mut chosen: Vec<Arc<Package>> = Vec::new();
        let mut forbidden: HashSet<String> = HashSet::new();

        let mut queue: VecDeque<(Atom, Vec<String>)> = world
            .atoms
            .iter()
            .map(|a| (a.clone(), Vec::new()))
            .collect();

        while let Some((atom, chain)) = queue.pop_front() {
            if atom.conflict {
                if let Some((pkg, _)) = chosen_tokens.get(&atom.name) {
                    return Err(ResolveError::Conflict {
                        name: pkg.name.clone(),
                        conflicting: format!("!{}", atom.name),
                        chain,
                    });
                }
                forbidden.insert(atom.name.clone());
                continue;
            }

            if let Some((pkg, version)) = chosen_tokens.get(&atom.name) {
                let satisfied = match atom.constraint {
                    Constraint::Any => true,
                    _ => version.as_ref().is_some_and(|v| atom.matches_version(v)),
                };
                if satisfied {
                    continue;
                }
                tracing::debug!(atom = %atom, chosen = %pkg.name, "prior choice does not satisfy atom");
                return Err(ResolveError::Unsatisfiable {
                    atom: atom.to_string(),
                    chain,
                });
            }

            let candidates = self.candidates(&atom);
            let Some(best) = candidates.first() else {
                if !atom.pin.is_empty() {
                    return Err(ResolveError::PinViolation {
                        atom: atom.to_string(),
                        pin: atom.pin.clone(),
                    });
                }
                return Err(ResolveError::Unsatisfiable {
                    atom: atom.to_string(),
                    chain,
                });
            };
            let pkg = Arc::clone(&best.pkg);

            if forbidden.contains(&pkg.name) {
                return Err(ResolveError::Conflict {
                    name: pkg.name.clone(),
                    conflicting: atom.to_string(),
                    chain,
                });
            }

            tracing::debug!(atom = %atom, pkg = %pkg.name, version = %pkg.version, "chose package");

            // Register the package under its own name and all its tokens.
            chosen_tokens.insert(
                pkg.name.clone(),
                (Arc::clone(&pkg), pkg.parsed_version()),
            );
            for token in &pkg.provides {
                let (name, version) = split_provides(token);
                chosen_tokens
                    .entry(name.to_string())
                    .or_insert_with(|| (Arc::clone(&pkg), version));
            }
            chosen.push(Arc::clone(&pkg));

            let mut child_chain = chain.clone();
            child_chain.push(pkg.name.clone());
            for dep in &pkg.depends {
                queue.push_back((Atom::parse(dep), child_chain.clone()));
            }
        }

        Ok(self.order_plan(chosen, &chosen_tokens))
    }

    /// Topological order over the chosen set, dependencies first. Cycle
    /// members come out in discovery order and are reported on the plan.
    fn order_plan(
        &self,
        chosen: Vec<Arc<Package>>,
        chosen_tokens: &HashMap<String, (Arc<Package>, Option<Version>)>,
    ) -> Plan {
        let positions: HashMap<&str, usize> = chosen
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();

        let mut ordered: Vec<Arc<Package>> = Vec::with_capacity(chosen.len());
        let mut done: HashSet<String> = HashSet::new();
        let mut in_progress: HashSet<String> = HashSet::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();

        fn visit(
            pkg: &Arc<Package>,
            chosen_tokens: &HashMap<String, (Arc<Package>, Option<Version>)>,
            positions: &HashMap<&str, usize>,
            ordered: &mut Vec<Arc<Package>>,
            done: &mut HashSet<String>,
            in_progress: &mut HashSet<String>,
            cycles: &mut Vec<Vec<String>>,
            stack: &mut Vec<String>,
        ) {
            if done.contains(&pkg.name) {
                return;
            }
            if !in_progress.insert(pkg.name.clone()) {
                // Mutual dependency: record the cycle slice once.
                if let Some(start) = stack.iter().position(|n| *n == pkg.name) {
                    let mut cycle: Vec<String> = stack[start..].to_vec();
                    cycle.sort();
                    if !cycles.contains(&cycle) {
                        cycles.push(cycle);
                    }
                }
                return;
            }
            stack.push(pkg.name.clone());
            for dep in &pkg.depends {
                let atom = Atom::parse(dep);
                if atom.conflict {
                    continue;
                }
                if let Some((dep_pkg, _)) = chosen_tokens.get(&atom.name) {
                    if positions.contains_key(dep_pkg.name.as_str()) {
                        visit(
                            dep_pkg,
                            chosen_tokens,
                            positions,
                            ordered,
                            done,
                            in_progress,
                            cycles,
                            stack,
                        );
                    }
                }
            }
            stack.pop();
            in_progress.remove(&pkg.name);
            if done.insert(pkg.name.clone()) {
                ordered.push(Arc::clone(pkg));
            }
        }

        let mut stack = Vec::new();
        for pkg in &chosen {
            visit(
                pkg,
                chosen_tokens,
                &positions,
                &mut ordered,
                &mut done,
                &mut in_progress,
                &mut cycles,
                &mut stack,
            );
        }

        Plan {
            packages: ordered,
            cycles,
        }
    }
}

/// Split a provides token `name[=version]` into its parts.
fn split_provides(token: &str) -> (&str, Option<Version>) {
    match token.split_once('=') {
        Some((name, version)) => (name, Version::parse(version).ok()),
        None => (token, None),
    }
}
