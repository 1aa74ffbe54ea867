use std::sync::Mutex;

use cellstream::constants::*;
use cellstream::mitigation::*;
use cellstream::operator::{Choice, Notice, Operator};
use cellstream::token_counting::{TokenAccountant, WhitespaceEncoder};
use cellstream::types::*;

/// Answers every picker with a fixed selection and records what it was shown.
struct FixedPicker {
    answer: Option<Vec<usize>>,
    shown: Mutex<Vec<Choice>>,
    notices: Mutex<Vec<(Notice, String)>>,
}

impl FixedPicker {
    fn new(answer: Option<Vec<usize>>) -> Self {
        Self {
            answer,
            shown: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
        }
    }
}

impl Operator for FixedPicker {
    async fn pick(&self, _title: &str, choices: &[Choice]) -> Option<Vec<usize>> {
        *self.shown.lock().unwrap() = choices.to_vec();
        self.answer.clone()
    }

    async fn confirm(&self, _question: &str) -> bool {
        false
    }

    fn notify(&self, level: Notice, message: &str) {
        self.notices.lock().unwrap().push((level, message.to_string()));
    }

    fn progress(&self, _message: &str) {}
}

fn words(n: usize) -> String {
    vec!["word"; n].join(" ")
}

/// Counted with one token per word: a 4238-word question (4 + 1 + 4238) and an
/// output message worth exactly 150 (4 + 1 + 143 + 2 markers), plus 3 priming.
fn overflowing_prompt() -> Vec<Message> {
    vec![
        Message::user(words(4238)),
        Message::user(format!(
            "<{m}>\n{}\n</{m}>",
            words(143),
            m = CODE_CELL_OUTPUT_MARKER
        )),
    ]
}

fn accountant() -> TokenAccountant {
    TokenAccountant::with_encoder(WhitespaceEncoder)
}

#[tokio::test]
async fn test_prompt_fixture_counts() {
    let acc = accountant();
    let messages = overflowing_prompt();
    assert_eq!(acc.count_tokens(&messages, &[]).unwrap(), 4396);
    let reduced = StrategyKind::RemoveOutput.apply(&messages);
    assert_eq!(acc.count_tokens(&reduced, &[]).unwrap(), 4246);
}

#[tokio::test]
async fn test_insufficient_reduction_is_an_error() {
    let messages = overflowing_prompt();
    let picker = FixedPicker::new(Some(vec![0]));
    let result = apply_token_reductions(
        OverflowContext {
            messages: &messages,
            tools: &[],
            overflow: 300,
            limit: 4096,
        },
        &accountant(),
        &picker,
        StrategyFilter::ShowAll,
    )
    .await;

    let err = match result {
        Err(e) => e,
        Ok(other) => panic!("Expected InsufficientReduction, got {:?}", other),
    };
    match err.inner {
        CellstreamError::InsufficientReduction {
            remaining_overflow,
            limit,
        } => {
            assert_eq!(remaining_overflow, 150);
            assert_eq!(limit, 4096);
        }
        other => panic!("Unexpected error: {:?}", other),
    }
    assert_eq!(
        *picker.notices.lock().unwrap(),
        vec![(Notice::Error, NOT_ENOUGH_SAVINGS.to_string())]
    );
}

#[tokio::test]
async fn test_sufficient_reduction_returns_new_messages() {
    let messages = overflowing_prompt();
    let picker = FixedPicker::new(Some(vec![0]));
    let reduced = apply_token_reductions(
        OverflowContext {
            messages: &messages,
            tools: &[],
            overflow: 96,
            limit: 4300,
        },
        &accountant(),
        &picker,
        StrategyFilter::ShowAll,
    )
    .await
    .unwrap()
    .expect("selection was made");

    assert_eq!(reduced.len(), 1);
    // Input untouched.
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_show_all_lists_every_strategy_unpicked() {
    let messages = overflowing_prompt();
    let picker = FixedPicker::new(None);
    let _ = apply_token_reductions(
        OverflowContext {
            messages: &messages,
            tools: &[],
            overflow: 300,
            limit: 4096,
        },
        &accountant(),
        &picker,
        StrategyFilter::ShowAll,
    )
    .await;

    let shown = picker.shown.lock().unwrap().clone();
    let labels: Vec<&str> = shown.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            REMOVE_OUTPUT,
            REMOVE_PROBLEMS,
            REMOVE_CODE_CELLS,
            REMOVE_SYSTEM_MSG,
            TABIFY_WHITESPACE
        ]
    );
    assert!(shown.iter().all(|c| !c.picked));
    assert_eq!(shown[0].description, "150 tokens");
}

#[tokio::test]
async fn test_hide_unprofitable_drops_zero_savings() {
    let messages = overflowing_prompt();
    let picker = FixedPicker::new(None);
    let _ = apply_token_reductions(
        OverflowContext {
            messages: &messages,
            tools: &[],
            overflow: 300,
            limit: 4096,
        },
        &accountant(),
        &picker,
        StrategyFilter::HideUnprofitable,
    )
    .await;

    // Code-cell removal matches on the marker prefix, so it also drops outputs.
    let shown = picker.shown.lock().unwrap().clone();
    let labels: Vec<&str> = shown.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec![REMOVE_OUTPUT, REMOVE_CODE_CELLS]);
}

#[tokio::test]
async fn test_empty_or_dismissed_selection_cancels() {
    let messages = overflowing_prompt();
    for answer in [None, Some(vec![])] {
        let picker = FixedPicker::new(answer);
        let outcome = apply_token_reductions(
            OverflowContext {
                messages: &messages,
                tools: &[],
                overflow: 300,
                limit: 4096,
            },
            &accountant(),
            &picker,
            StrategyFilter::ShowAll,
        )
        .await
        .unwrap();
        assert!(outcome.is_none());
        assert!(picker.notices.lock().unwrap().is_empty());
    }
}

#[test]
fn test_strategies_apply_in_list_order_on_reduced_messages() {
    let messages = vec![
        Message::user("<JupyterCodeCell>```python \n    x = 1\n```</JupyterCodeCell>").with_name("code"),
        Message::user("<JupyterCodeCellProblems>:\nE1: bad\n</JupyterCodeCellProblems>"),
        Message::user("    indented prose"),
        Message::system("sys"),
    ];
    let mut reduced = messages.clone();
    for kind in [StrategyKind::RemoveCodeCells, StrategyKind::RemoveSystemMessage, StrategyKind::Tabify] {
        reduced = kind.apply(&reduced);
    }
    assert_eq!(reduced.len(), 1);
    assert_eq!(reduced[0].content_str(), "\tindented prose");
}
