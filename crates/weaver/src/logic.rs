//! Boolean logic kernel for branch-condition tracking.
//!
//! Conditions are kept in disjunctive normal form over interned term ids:
//! a [`Conjunction`] is a set of `(term, polarity)` pairs, a
//! [`Disjunction`] a set of conjunctions. Ordered sets give every formula
//! a canonical serialisation for free - terms sort by id then polarity,
//! conjunctions lexicographically - which is what makes condition-term
//! ids a deterministic function of the input.
//!
//! The simplifier only needs to catch trivial redundancy: duplicate
//! conjunctions collapse in the set, contradictory conjunctions (a term
//! with both polarities) are dropped, and a conjunction strictly subsumed
//! by a smaller one is dropped. The formulas stay tens of terms at most,
//! so nothing heavier than set operations is warranted.

use std::collections::BTreeSet;

/// Dense id of an interned condition term.
pub type TermId = u32;

/// One signed occurrence of a condition term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignedTerm {
    pub term: TermId,
    /// `true` for the term itself, `false` for its negation
    pub polarity: bool,
}

impl SignedTerm {
    pub fn positive(term: TermId) -> Self {
        SignedTerm {
            term,
            polarity: true,
        }
    }

    pub fn negative(term: TermId) -> Self {
        SignedTerm {
            term,
            polarity: false,
        }
    }
}

/// An unordered conjunction of signed terms. Empty means `true`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Conjunction(pub BTreeSet<SignedTerm>);

impl Conjunction {
    pub fn new() -> Self {
        Conjunction(BTreeSet::new())
    }

    pub fn is_true(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, term: TermId, polarity: bool) {
        self.0.insert(SignedTerm { term, polarity });
    }

    /// A conjunction is contradictory when it contains some term with
    /// both polarities.
    pub fn is_contradictory(&self) -> bool {
        self.0
            .iter()
            .filter(|t| t.polarity)
            .any(|t| self.0.contains(&SignedTerm::negative(t.term)))
    }

    /// True when `self` contains every literal of `other`.
    pub fn subsumes(&self, other: &Conjunction) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignedTerm> {
        self.0.iter()
    }
}

/// A disjunction of conjunctions (DNF). Empty means `false`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disjunction(pub BTreeSet<Conjunction>);

impl Disjunction {
    pub fn new() -> Self {
        Disjunction(BTreeSet::new())
    }

    pub fn singleton(conj: Conjunction) -> Self {
        let mut set = BTreeSet::new();
        set.insert(conj);
        Disjunction(set)
    }

    pub fn insert(&mut self, conj: Conjunction) {
        self.0.insert(conj);
    }

    pub fn union(&mut self, other: &Disjunction) {
        for conj in &other.0 {
            self.0.insert(conj.clone());
        }
    }

    pub fn is_false(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the formula is trivially `true`: after simplification
    /// that is exactly "contains the empty conjunction".
    pub fn is_true(&self) -> bool {
        self.0.iter().any(Conjunction::is_true)
    }

    /// Simplify in DNF:
    ///
    /// 1. drop contradictory conjunctions (`t && !t`);
    /// 2. drop any conjunction strictly subsumed by another kept one
    ///    (if `C ⊋ C'` then `C` is redundant).
    ///
    /// Idempotent and monotone; the set representation already merged
    /// duplicates.
    pub fn simplify(&self) -> Disjunction {
        let live: Vec<&Conjunction> = self.0.iter().filter(|c| !c.is_contradictory()).collect();
        let mut kept = BTreeSet::new();
        for &c in &live {
            // set members are distinct, so c ⊇ other with other ≠ c is
            // strict subsumption
            let subsumed = live.iter().any(|&other| other != c && c.subsumes(other));
            if !subsumed {
                kept.insert(c.clone());
            }
        }
        Disjunction(kept)
    }

    /// Term ids referenced anywhere in the formula.
    pub fn referenced_terms(&self) -> BTreeSet<TermId> {
        self.0
            .iter()
            .flat_map(|c| c.0.iter().map(|t| t.term))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conj(terms: &[(TermId, bool)]) -> Conjunction {
        let mut c = Conjunction::new();
        for &(t, p) in terms {
            c.insert(t, p);
        }
        c
    }

    #[test]
    fn contradiction_is_dropped() {
        let mut d = Disjunction::new();
        d.insert(conj(&[(0, true), (0, false)]));
        d.insert(conj(&[(1, true)]));
        let s = d.simplify();
        assert_eq!(s.0.len(), 1);
        assert!(s.0.contains(&conj(&[(1, true)])));
    }

    #[test]
    fn strict_superset_is_subsumed() {
        let mut d = Disjunction::new();
        d.insert(conj(&[(0, true)]));
        d.insert(conj(&[(0, true), (1, false)]));
        let s = d.simplify();
        assert_eq!(s.0.len(), 1);
        assert!(s.0.contains(&conj(&[(0, true)])));
    }

    #[test]
    fn empty_conjunction_subsumes_everything() {
        let mut d = Disjunction::new();
        d.insert(Conjunction::new());
        d.insert(conj(&[(0, true)]));
        d.insert(conj(&[(2, false), (3, true)]));
        let s = d.simplify();
        assert_eq!(s.0.len(), 1);
        assert!(s.is_true());
    }

    #[test]
    fn simplify_is_idempotent() {
        let mut d = Disjunction::new();
        d.insert(conj(&[(0, true), (1, true)]));
        d.insert(conj(&[(0, true)]));
        d.insert(conj(&[(2, true), (2, false)]));
        let once = d.simplify();
        let twice = once.simplify();
        assert_eq!(once, twice);
    }

    #[test]
    fn identical_conjunctions_merge_in_the_set() {
        let mut d = Disjunction::new();
        d.insert(conj(&[(1, true), (0, true)]));
        d.insert(conj(&[(0, true), (1, true)]));
        assert_eq!(d.0.len(), 1);
    }

    #[test]
    fn empty_disjunction_is_false_not_true() {
        let d = Disjunction::new();
        assert!(d.is_false());
        assert!(!d.is_true());
        assert!(d.simplify().is_false());
    }

    #[test]
    fn referenced_terms_span_all_conjunctions() {
        let mut d = Disjunction::new();
        d.insert(conj(&[(3, true)]));
        d.insert(conj(&[(1, false), (4, true)]));
        let terms: Vec<TermId> = d.referenced_terms().into_iter().collect();
        assert_eq!(terms, vec![1, 3, 4]);
    }
}
