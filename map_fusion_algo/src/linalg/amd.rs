//! Approximate minimum degree (AMD) fill-reducing ordering
//!
//! Eliminating a variable of the information matrix connects all of its
//! neighbours (fill-in). Ordering the state so that low-degree variables are
//! eliminated first keeps the Cholesky factor sparse. This module runs the AMD
//! pattern on the block adjacency graph, represented as a quotient graph of
//! variables and elements:
//!
//! 1. Pick the variable `p` of minimum approximate degree
//! 2. Turn `p` into an element whose variable set `Lp` is the union of its
//!    variable neighbours and of every element adjacent to `p` (those elements
//!    are absorbed into `p`)
//! 3. Prune explicit edges covered by `Lp`, absorb elements whose variables all
//!    lie inside `Lp`, and recompute the approximate external degree of every
//!    variable in `Lp` as the minimum of three upper bounds
//! 4. Merge indistinguishable variables of `Lp` into supervariables; a
//!    supervariable is eliminated as a whole (mass elimination)
//!
//! ## References
//! - [An Approximate Minimum Degree Ordering Algorithm](https://doi.org/10.1137/S0895479894278952)
//! - [Sparse Local Submap Joining Filter](https://doi.org/10.1109/TRO.2008.2003259)

use std::collections::{BTreeSet, HashMap};

use super::sparse_block::{SparseBlockColumn, SparseBlockMatrix};
use crate::error::{FusionError, FusionResult};

/// Bijective reordering of state indices
///
/// `order[new] = old` and `inverse[old] = new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    order: Vec<usize>,
    inverse: Vec<usize>,
}

impl Permutation {
    pub fn identity(n: usize) -> Self {
        Self {
            order: (0..n).collect(),
            inverse: (0..n).collect(),
        }
    }

    /// Build from an elimination order, rejecting anything that is not a bijection
    pub fn from_order(order: Vec<usize>) -> FusionResult<Self> {
        let n = order.len();
        let mut inverse = vec![usize::MAX; n];
        for (new, &old) in order.iter().enumerate() {
            if old >= n {
                return Err(FusionError::InvalidPermutation(format!(
                    "index {old} outside 0..{n}"
                )));
            }
            if inverse[old] != usize::MAX {
                return Err(FusionError::InvalidPermutation(format!(
                    "index {old} appears twice"
                )));
            }
            inverse[old] = new;
        }
        Ok(Self { order, inverse })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn inverse(&self) -> &[usize] {
        &self.inverse
    }

    /// Position of old index `old` after reordering
    pub fn new_index(&self, old: usize) -> usize {
        self.inverse[old]
    }

    /// Old index now stored at position `new`
    pub fn old_index(&self, new: usize) -> usize {
        self.order[new]
    }

    pub fn is_identity(&self) -> bool {
        self.order.iter().enumerate().all(|(i, &o)| i == o)
    }
}

/// Values indexed by state position that must follow a reordering
pub trait Permute: Sized {
    fn permute(&self, permutation: &Permutation) -> FusionResult<Self>;
}

impl Permute for SparseBlockMatrix {
    fn permute(&self, permutation: &Permutation) -> FusionResult<Self> {
        self.permuted(permutation)
    }
}

impl Permute for SparseBlockColumn {
    fn permute(&self, permutation: &Permutation) -> FusionResult<Self> {
        self.permuted(permutation)
    }
}

/// Configuration for the minimum degree ordering
#[derive(Debug, Clone)]
pub struct MinimumDegreeConfig {
    /// Absorb elements whose variables are all covered by the new element
    pub aggressive_absorption: bool,
    /// Merge indistinguishable variables into supervariables
    pub detect_supervariables: bool,
}

impl Default for MinimumDegreeConfig {
    fn default() -> Self {
        Self {
            aggressive_absorption: true,
            detect_supervariables: true,
        }
    }
}

/// Matrix, vector and state after one consistent reordering
#[derive(Debug, Clone)]
pub struct Reordered<S> {
    pub permutation: Permutation,
    pub matrix: SparseBlockMatrix,
    pub vector: SparseBlockColumn,
    pub state: S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Variable,
    Element,
    Absorbed,
    Merged,
}

/// Quotient graph of uneliminated variables and formed elements
struct QuotientGraph {
    node: Vec<Node>,
    /// A_i: variables adjacent to variable i
    var_adj: Vec<BTreeSet<usize>>,
    /// E_i: elements adjacent to variable i
    elem_adj: Vec<BTreeSet<usize>>,
    /// L_e: variables adjacent to element e
    elem_vars: Vec<BTreeSet<usize>>,
    weight: Vec<usize>,
    members: Vec<Vec<usize>>,
    degree: Vec<usize>,
    queue: BTreeSet<(usize, usize)>,
    /// Total weight of uneliminated variables
    remaining: usize,
}

impl QuotientGraph {
    fn new(adjacency: &[BTreeSet<usize>]) -> Self {
        let n = adjacency.len();
        let var_adj: Vec<BTreeSet<usize>> = adjacency
            .iter()
            .enumerate()
            .map(|(i, adj)| adj.iter().copied().filter(|&j| j != i && j < n).collect())
            .collect();
        let degree: Vec<usize> = var_adj.iter().map(|a| a.len()).collect();
        let queue = degree.iter().enumerate().map(|(i, &d)| (d, i)).collect();
        Self {
            node: vec![Node::Variable; n],
            var_adj,
            elem_adj: vec![BTreeSet::new(); n],
            elem_vars: vec![BTreeSet::new(); n],
            weight: vec![1; n],
            members: (0..n).map(|i| vec![i]).collect(),
            degree,
            queue,
            remaining: n,
        }
    }

    fn pop_min(&mut self) -> Option<usize> {
        let first = self.queue.iter().next().copied()?;
        self.queue.remove(&first);
        Some(first.1)
    }

    fn set_degree(&mut self, i: usize, degree: usize) {
        self.queue.remove(&(self.degree[i], i));
        self.degree[i] = degree;
        self.queue.insert((degree, i));
    }

    fn weight_of<'a>(&self, vars: impl Iterator<Item = &'a usize>) -> usize {
        vars.map(|&v| self.weight[v]).sum()
    }

    fn eliminate(&mut self, p: usize, order: &mut Vec<usize>, config: &MinimumDegreeConfig) {
        // Form the new element; elements adjacent to p are absorbed into it
        let mut lp = BTreeSet::new();
        let absorbed: Vec<usize> = self.elem_adj[p].iter().copied().collect();
        for e in absorbed {
            lp.extend(self.elem_vars[e].iter().copied());
            self.elem_vars[e].clear();
            self.node[e] = Node::Absorbed;
        }
        lp.extend(self.var_adj[p].iter().copied());
        lp.remove(&p);
        lp.retain(|&v| self.node[v] == Node::Variable);

        self.node[p] = Node::Element;
        self.remaining -= self.weight[p];
        order.append(&mut self.members[p]);
        self.var_adj[p].clear();
        self.elem_adj[p].clear();

        for &i in &lp {
            let node = &self.node;
            self.elem_adj[i].retain(|&e| node[e] == Node::Element);
            self.elem_adj[i].insert(p);
            self.var_adj[i].remove(&p);
            self.var_adj[i].retain(|j| !lp.contains(j));
        }
        self.elem_vars[p] = lp.clone();

        if config.aggressive_absorption {
            self.absorb_covered_elements(p, &lp);
        }

        self.update_degrees(p, &lp);

        if config.detect_supervariables {
            self.merge_indistinguishable(&lp);
        }
    }

    /// Absorb every element e != p with L_e contained in Lp
    fn absorb_covered_elements(&mut self, p: usize, lp: &BTreeSet<usize>) {
        let candidates: BTreeSet<usize> = lp
            .iter()
            .flat_map(|&i| self.elem_adj[i].iter().copied())
            .filter(|&e| e != p)
            .collect();
        for e in candidates {
            if self.elem_vars[e].iter().all(|v| lp.contains(v)) {
                let vars: Vec<usize> = self.elem_vars[e].iter().copied().collect();
                for v in vars {
                    self.elem_adj[v].remove(&e);
                }
                self.elem_vars[e].clear();
                self.node[e] = Node::Absorbed;
            }
        }
    }

    /// Approximate external degree: min of the outer, previous-degree and
    /// element bounds
    fn update_degrees(&mut self, p: usize, lp: &BTreeSet<usize>) {
        let lp_weight = self.weight_of(lp.iter());
        for &i in lp {
            let external_lp = lp_weight - self.weight[i];
            let element_term: usize = self.elem_adj[i]
                .iter()
                .filter(|&&e| e != p)
                .map(|&e| {
                    self.elem_vars[e]
                        .iter()
                        .filter(|v| !lp.contains(v))
                        .map(|&v| self.weight[v])
                        .sum::<usize>()
                })
                .sum();
            let adjacency_term = self.weight_of(self.var_adj[i].iter());

            let outer_bound = self.remaining - self.weight[i];
            let previous_bound = self.degree[i] + external_lp;
            let element_bound = adjacency_term + external_lp + element_term;
            let degree = outer_bound.min(previous_bound).min(element_bound);
            self.set_degree(i, degree);
        }
    }

    /// Variables of Lp with identical element and variable adjacency become one
    fn merge_indistinguishable(&mut self, lp: &BTreeSet<usize>) {
        let mut representatives: HashMap<(Vec<usize>, Vec<usize>), usize> = HashMap::new();
        for &j in lp {
            if self.node[j] != Node::Variable {
                continue;
            }
            let key = (
                self.elem_adj[j].iter().copied().collect::<Vec<_>>(),
                self.var_adj[j].iter().copied().collect::<Vec<_>>(),
            );
            match representatives.get(&key) {
                Some(&i) => self.merge(i, j),
                None => {
                    representatives.insert(key, j);
                }
            }
        }
    }

    fn merge(&mut self, i: usize, j: usize) {
        let wj = self.weight[j];
        self.queue.remove(&(self.degree[j], j));
        for e in std::mem::take(&mut self.elem_adj[j]) {
            self.elem_vars[e].remove(&j);
        }
        for a in std::mem::take(&mut self.var_adj[j]) {
            self.var_adj[a].remove(&j);
        }
        let mut moved = std::mem::take(&mut self.members[j]);
        self.members[i].append(&mut moved);
        self.weight[i] += wj;
        self.weight[j] = 0;
        self.node[j] = Node::Merged;
        let degree = self.degree[i].saturating_sub(wj);
        self.set_degree(i, degree);
    }
}

/// Fill-reducing reorderer for the block information matrix
#[derive(Debug, Clone)]
pub struct MinimumDegreeReorderer {
    config: MinimumDegreeConfig,
}

impl Default for MinimumDegreeReorderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MinimumDegreeReorderer {
    pub fn new() -> Self {
        Self {
            config: MinimumDegreeConfig::default(),
        }
    }

    pub fn with_config(config: MinimumDegreeConfig) -> Self {
        Self { config }
    }

    /// Elimination order for a symmetric adjacency structure
    pub fn order(&self, adjacency: &[BTreeSet<usize>]) -> FusionResult<Permutation> {
        let n = adjacency.len();
        let mut graph = QuotientGraph::new(adjacency);
        let mut order = Vec::with_capacity(n);
        while let Some(p) = graph.pop_min() {
            graph.eliminate(p, &mut order, &self.config);
        }
        if order.len() != n {
            return Err(FusionError::InvalidPermutation(format!(
                "ordering covered {} of {n} variables",
                order.len()
            )));
        }
        Permutation::from_order(order)
    }

    /// Elimination order for the block pattern of `matrix`
    pub fn compute(&self, matrix: &SparseBlockMatrix) -> FusionResult<Permutation> {
        self.order(&matrix.adjacency())
    }

    /// Reorder matrix, vector and state together
    ///
    /// Nothing is mutated: the permuted copies are returned so the caller can
    /// swap all three in at once.
    pub fn reorder<S: Permute>(
        &self,
        matrix: &SparseBlockMatrix,
        vector: &SparseBlockColumn,
        state: &S,
    ) -> FusionResult<Reordered<S>> {
        let permutation = self.compute(matrix)?;
        Ok(Reordered {
            matrix: matrix.permute(&permutation)?,
            vector: vector.permute(&permutation)?,
            state: state.permute(&permutation)?,
            permutation,
        })
    }
}
