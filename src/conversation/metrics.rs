//! 对话计数与 Token 统计
//!
//! 纯值类型，每轮累加。不变式：会话总量 = 各 statement 总量之和 = 各 turn 总量之和。

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token 使用量（单次响应或累计）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cache_read_input_tokens: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens + rhs.cache_read_input_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |acc, u| acc + u)
    }
}

/// 会话计数器
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetrics {
    pub statement_count: u64,
    pub statement_turn_count: u64,
    pub conversation_turn_count: u64,
    #[serde(default)]
    pub tool_result_count: u64,
}

/// turn / statement / conversation 三级 Token 账本
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageLedger {
    pub turn: TokenUsage,
    pub statement: TokenUsage,
    pub conversation: TokenUsage,
    /// 每个 statement 的总量（含当前进行中的一条）
    #[serde(default)]
    pub statements: Vec<TokenUsage>,
}

impl TokenUsageLedger {
    pub fn begin_statement(&mut self) {
        self.statement = TokenUsage::default();
        self.turn = TokenUsage::default();
        self.statements.push(TokenUsage::default());
    }

    /// 记录一次模型响应的用量
    pub fn record_turn(&mut self, usage: TokenUsage) {
        if self.statements.is_empty() {
            self.statements.push(TokenUsage::default());
        }
        self.turn = usage;
        self.statement += usage;
        self.conversation += usage;
        if let Some(current) = self.statements.last_mut() {
            *current += usage;
        }
    }

    pub fn statements_total(&self) -> TokenUsage {
        self.statements.iter().copied().sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.statements_total() == self.conversation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!((usage + usage).total_tokens, 300);
    }

    #[test]
    fn test_ledger_tracks_levels() {
        let mut ledger = TokenUsageLedger::default();
        ledger.begin_statement();
        ledger.record_turn(TokenUsage::new(10, 5));
        ledger.record_turn(TokenUsage::new(20, 5));
        assert_eq!(ledger.turn.total_tokens, 25);
        assert_eq!(ledger.statement.total_tokens, 40);

        ledger.begin_statement();
        assert_eq!(ledger.statement.total_tokens, 0);
        ledger.record_turn(TokenUsage::new(1, 1));
        assert_eq!(ledger.conversation.total_tokens, 42);
        assert_eq!(ledger.statements.len(), 2);
        assert!(ledger.is_consistent());
    }

    proptest! {
        /// 任意 statement/turn 组合下，会话总量等于各 statement 之和
        #[test]
        fn conversation_total_equals_sum_of_statements(
            statements in prop::collection::vec(
                prop::collection::vec((0u64..10_000, 0u64..10_000), 0..6),
                1..8,
            )
        ) {
            let mut ledger = TokenUsageLedger::default();
            let mut expected = 0u64;
            for turns in &statements {
                ledger.begin_statement();
                for (input, output) in turns {
                    ledger.record_turn(TokenUsage::new(*input, *output));
                    expected += input + output;
                }
            }
            prop_assert!(ledger.is_consistent());
            prop_assert_eq!(ledger.conversation.total_tokens, expected);
        }
    }
}
