use proptest::prelude::*;

/// Lowercase multi-label names in their canonical form.
pub(crate) fn arb_qname() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z0-9]{1,12}", 1..5).prop_map(|labels| labels.join("."))
}
