use proptest::prelude::*;
use stepwise_core::state_machine::ExecutionStatus;

/// Terminal statuses a branch can report
pub fn terminal_status_strategy() -> impl Strategy<Value = ExecutionStatus> {
    prop_oneof![
        4 => Just(ExecutionStatus::Success),
        1 => Just(ExecutionStatus::Skipped),
        2 => Just(ExecutionStatus::Failed),
        1 => Just(ExecutionStatus::Error),
    ]
}

/// Branch outcomes in delivery order
pub fn delivery_order_strategy() -> impl Strategy<Value = Vec<ExecutionStatus>> {
    prop::collection::vec(terminal_status_strategy(), 1..12)
}

/// State names that are unique within a workflow
pub fn state_names_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z][a-z0-9_]{0,15}", 1..10)
        .prop_map(|names| names.into_iter().collect())
}

/// Template segments: literal text or a placeholder for a param index
#[derive(Debug, Clone)]
pub enum TemplatePart {
    Literal(String),
    Param(usize),
}

pub fn template_strategy(params: usize) -> impl Strategy<Value = Vec<TemplatePart>> {
    prop::collection::vec(
        prop_oneof![
            "[a-zA-Z0-9 ./_-]{0,12}".prop_map(TemplatePart::Literal),
            (0..params).prop_map(TemplatePart::Param),
        ],
        0..8,
    )
}
