use crate::data::osm::{Element, FeatureKind};
use crate::data::tags::{TagIndex, TagStore};

use super::Fingerprint;

/// Result of evaluating one rule node. `Ignore` drops out of and/or folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    False,
    True,
    Ignore,
}

impl TriState {
    fn from_bool(value: bool) -> TriState {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Type(FeatureKind),
    /// A missing value matches on the key alone. `bound` is the interned
    /// form in the store the rule was last bound to; `None` never matches.
    Tag {
        key: String,
        value: Option<String>,
        bound: Option<TagIndex>,
    },
    Not(Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
}

impl ExprKind {
    fn opcode(&self) -> u8 {
        match self {
            ExprKind::Type(_) => 0,
            ExprKind::Tag { .. } => 1,
            ExprKind::Not(_) => 2,
            ExprKind::And(_) => 3,
            ExprKind::Or(_) => 4,
        }
    }
}

/// Immutable rule tree node carrying the fingerprint of its subtree.
#[derive(Debug, Clone)]
pub struct Expression {
    kind: ExprKind,
    disabled: bool,
    fingerprint: Fingerprint,
}

fn kind_byte(kind: FeatureKind) -> u8 {
    match kind {
        FeatureKind::Node => 0,
        FeatureKind::Way => 1,
        FeatureKind::Relation => 2,
    }
}

impl Expression {
    fn sealed(kind: ExprKind, disabled: bool) -> Expression {
        let fingerprint = Self::compute_fingerprint(&kind, disabled);
        Expression { kind, disabled, fingerprint }
    }

    fn compute_fingerprint(kind: &ExprKind, disabled: bool) -> Fingerprint {
        let b = Fingerprint::builder()
            .byte(disabled as u8)
            .byte(kind.opcode());
        let b = match kind {
            ExprKind::Type(k) => b.byte(kind_byte(*k)),
            ExprKind::Tag { key, value, .. } => {
                let b = b.str(key);
                match value {
                    Some(value) => b.byte(1).str(value),
                    None => b.byte(0),
                }
            },
            ExprKind::Not(child) => b.fingerprint(&child.fingerprint),
            ExprKind::And(children) | ExprKind::Or(children) => children.iter()
                .fold(b, |b, c| b.fingerprint(&c.fingerprint)),
        };
        b.finish()
    }

    pub fn type_of(kind: FeatureKind) -> Expression {
        Self::sealed(ExprKind::Type(kind), false)
    }

    pub fn tag(key: &str, value: Option<&str>, tags: &TagStore) -> Expression {
        Self::sealed(
            ExprKind::Tag {
                key: key.to_string(),
                value: value.map(str::to_string),
                bound: tags.find(key, value),
            },
            false,
        )
    }

    pub fn not(child: Expression) -> Expression {
        Self::sealed(ExprKind::Not(Box::new(child)), false)
    }

    pub fn and(children: Vec<Expression>) -> Expression {
        Self::sealed(ExprKind::And(children), false)
    }

    pub fn or(children: Vec<Expression>) -> Expression {
        Self::sealed(ExprKind::Or(children), false)
    }

    pub fn with_disabled(self, disabled: bool) -> Expression {
        Self::sealed(self.kind, disabled)
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Two trees are the same exactly when their fingerprints are.
    pub fn same(&self, other: &Expression) -> bool {
        self.fingerprint == other.fingerprint
    }

    pub fn evaluate(&self, element: &Element) -> TriState {
        if self.disabled {
            return TriState::Ignore;
        }
        match &self.kind {
            ExprKind::Type(kind) => TriState::from_bool(element.kind == *kind),
            ExprKind::Tag { bound, .. } => match bound {
                Some(tag) => TriState::from_bool(element.has_tag(tag)),
                None => TriState::False,
            },
            ExprKind::Not(child) => match child.evaluate(element) {
                TriState::True => TriState::False,
                TriState::False => TriState::True,
                TriState::Ignore => TriState::Ignore,
            },
            ExprKind::And(children) => {
                let mut seen_true = false;
                for child in children.iter().filter(|c| !c.disabled) {
                    match child.evaluate(element) {
                        TriState::False => return TriState::False,
                        TriState::True => seen_true = true,
                        TriState::Ignore => (),
                    }
                }
                if seen_true { TriState::True } else { TriState::Ignore }
            },
            ExprKind::Or(children) => {
                let mut seen_false = false;
                for child in children.iter().filter(|c| !c.disabled) {
                    match child.evaluate(element) {
                        TriState::True => return TriState::True,
                        TriState::False => seen_false = true,
                        TriState::Ignore => (),
                    }
                }
                if seen_false { TriState::False } else { TriState::Ignore }
            },
        }
    }

    /// Re-resolves every tag node against `tags`. The fingerprint does not
    /// change since it only covers the text.
    pub fn bind(&mut self, tags: &TagStore) {
        match &mut self.kind {
            ExprKind::Type(_) => (),
            ExprKind::Tag { key, value, bound } => {
                *bound = tags.find(key, value.as_deref());
            },
            ExprKind::Not(child) => child.bind(tags),
            ExprKind::And(children) | ExprKind::Or(children) => {
                for child in children {
                    child.bind(tags);
                }
            },
        }
    }

    /// Puts and/or children into fingerprint order, bottom up, so that trees
    /// differing only in operand order become the same.
    pub fn reorder(&mut self) {
        match &mut self.kind {
            ExprKind::Type(_) | ExprKind::Tag { .. } => return,
            ExprKind::Not(child) => child.reorder(),
            ExprKind::And(children) | ExprKind::Or(children) => {
                for child in children.iter_mut() {
                    child.reorder();
                }
                children.sort_by_key(|c| c.fingerprint);
            },
        }
        self.fingerprint = Self::compute_fingerprint(&self.kind, self.disabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store_and_way(tags: &[(&str, &str)]) -> (TagStore, Element) {
        let mut store = TagStore::new();
        let mut element = Element::new(1, FeatureKind::Way);
        for (k, v) in tags {
            element.add_tag(store.find_or_intern(k, Some(v)));
        }
        (store, element)
    }

    #[test]
    fn type_and_tag_leaves() {
        let (store, way) = store_and_way(&[("highway", "primary")]);
        assert_eq!(Expression::type_of(FeatureKind::Way).evaluate(&way), TriState::True);
        assert_eq!(Expression::type_of(FeatureKind::Node).evaluate(&way), TriState::False);
        assert_eq!(Expression::tag("highway", None, &store).evaluate(&way), TriState::True);
        assert_eq!(Expression::tag("highway", Some("primary"), &store).evaluate(&way), TriState::True);
        assert_eq!(Expression::tag("highway", Some("footway"), &store).evaluate(&way), TriState::False);
        assert_eq!(Expression::tag("unknown", None, &store).evaluate(&way), TriState::False);
    }

    #[test]
    fn disabled_children_do_not_count() {
        let (store, way) = store_and_way(&[("a", "1")]);
        let only_disabled = Expression::and(vec![
            Expression::tag("b", None, &store).with_disabled(true),
        ]);
        assert_eq!(only_disabled.evaluate(&way), TriState::Ignore);
        assert_eq!(Expression::and(vec![]).evaluate(&way), TriState::Ignore);
        assert_eq!(Expression::or(vec![]).evaluate(&way), TriState::Ignore);

        let mixed = Expression::and(vec![
            Expression::tag("b", None, &store).with_disabled(true),
            Expression::tag("a", None, &store),
        ]);
        assert_eq!(mixed.evaluate(&way), TriState::True);
        assert_eq!(Expression::not(only_disabled).evaluate(&way), TriState::Ignore);
    }

    #[test]
    fn disabled_flag_changes_fingerprint() {
        let store = TagStore::new();
        let a = Expression::tag("a", None, &store);
        let b = a.clone().with_disabled(true);
        assert!(!a.same(&b));
    }

    #[test]
    fn bind_picks_up_tags_interned_later() {
        let mut store = TagStore::new();
        let mut expr = Expression::tag("shop", Some("bakery"), &store);
        let fingerprint = expr.fingerprint();
        let mut element = Element::new(3, FeatureKind::Node);
        element.add_tag(store.find_or_intern("shop", Some("bakery")));
        assert_eq!(expr.evaluate(&element), TriState::False);
        expr.bind(&store);
        assert_eq!(expr.evaluate(&element), TriState::True);
        assert_eq!(expr.fingerprint(), fingerprint);
    }

    #[test]
    fn reorder_makes_operand_order_irrelevant() {
        let store = TagStore::new();
        let mut ab = Expression::and(vec![
            Expression::tag("a", Some("1"), &store),
            Expression::or(vec![Expression::type_of(FeatureKind::Way), Expression::tag("c", None, &store)]),
        ]);
        let mut ba = Expression::and(vec![
            Expression::or(vec![Expression::tag("c", None, &store), Expression::type_of(FeatureKind::Way)]),
            Expression::tag("a", Some("1"), &store),
        ]);
        assert!(!ab.same(&ba));
        ab.reorder();
        ba.reorder();
        assert!(ab.same(&ba));
    }

    proptest! {
        #[test]
        fn tag_or_not_tag_is_always_true(value in "[a-z]{0,6}", present in any::<bool>()) {
            let mut store = TagStore::new();
            let mut element = Element::new(1, FeatureKind::Way);
            if present {
                element.add_tag(store.find_or_intern("x", Some(&value)));
            }
            let expr = Expression::or(vec![
                Expression::tag("x", None, &store),
                Expression::not(Expression::tag("x", None, &store)),
            ]);
            prop_assert_eq!(expr.evaluate(&element), TriState::True);
        }

        #[test]
        fn reorder_is_invariant_under_shuffles(keys in prop::collection::vec("[a-e]{1,3}", 1..6), rot in 0usize..6) {
            let store = TagStore::new();
            let build = |ks: &[String]| Expression::or(
                ks.iter().map(|k| Expression::tag(k, Some("v"), &store)).collect()
            );
            let mut rotated = keys.clone();
            let len = rotated.len();
            rotated.rotate_left(rot % len);
            let mut a = build(&keys[..]);
            let mut b = build(&rotated[..]);
            a.reorder();
            b.reorder();
            prop_assert!(a.same(&b));
        }
    }
}
