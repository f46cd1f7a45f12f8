//! 医嘱状态机
//!
//! 管理检验医嘱的完整生命周期状态转换。汇总状态由项目状态推导的部分
//! 在仓储临界区内完成, 这里约束的是显式操作(采样/审核/重测/取消)。

use lis_core::{LisError, OrderStatus, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 医嘱状态转换动作
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderAction {
    Collect,
    StartProcessing,
    AllResulted,
    PreliminaryApprove,
    FinalApprove,
    CancelApproval,
    Rerun,
    Cancel,
}

/// 医嘱状态机
#[derive(Debug)]
pub struct OrderStateMachine {
    transitions: HashMap<(OrderStatus, OrderAction), OrderStatus>,
}

impl OrderStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        // 定义状态转换规则; Pending为初始态, Cancelled为终态
        transitions.insert(
            (OrderStatus::Pending, OrderAction::Collect),
            OrderStatus::Collected,
        );
        transitions.insert(
            (OrderStatus::Pending, OrderAction::Cancel),
            OrderStatus::Cancelled,
        );
        transitions.insert(
            (OrderStatus::Collected, OrderAction::StartProcessing),
            OrderStatus::Processing,
        );
        transitions.insert(
            (OrderStatus::Collected, OrderAction::Cancel),
            OrderStatus::Cancelled,
        );
        transitions.insert(
            (OrderStatus::Processing, OrderAction::AllResulted),
            OrderStatus::PendingApproval,
        );
        transitions.insert(
            (OrderStatus::Processing, OrderAction::Cancel),
            OrderStatus::Cancelled,
        );
        transitions.insert(
            (OrderStatus::PendingApproval, OrderAction::PreliminaryApprove),
            OrderStatus::PreliminaryApproved,
        );
        transitions.insert(
            (OrderStatus::PendingApproval, OrderAction::FinalApprove),
            OrderStatus::Approved,
        );
        transitions.insert(
            (OrderStatus::PendingApproval, OrderAction::Rerun),
            OrderStatus::Processing,
        );
        transitions.insert(
            (OrderStatus::PendingApproval, OrderAction::Cancel),
            OrderStatus::Cancelled,
        );
        transitions.insert(
            (
                OrderStatus::PreliminaryApproved,
                OrderAction::PreliminaryApprove,
            ),
            OrderStatus::PreliminaryApproved,
        );
        transitions.insert(
            (OrderStatus::PreliminaryApproved, OrderAction::FinalApprove),
            OrderStatus::Approved,
        );
        transitions.insert(
            (OrderStatus::PreliminaryApproved, OrderAction::Rerun),
            OrderStatus::Processing,
        );
        transitions.insert(
            (OrderStatus::PreliminaryApproved, OrderAction::Cancel),
            OrderStatus::Cancelled,
        );
        transitions.insert(
            (OrderStatus::Approved, OrderAction::CancelApproval),
            OrderStatus::PendingApproval,
        );
        transitions.insert(
            (OrderStatus::Approved, OrderAction::Rerun),
            OrderStatus::Processing,
        );

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: OrderStatus, action: &OrderAction) -> bool {
        self.transitions.contains_key(&(from, action.clone()))
    }

    /// 执行状态转换
    pub fn transition(&self, from: OrderStatus, action: &OrderAction) -> Result<OrderStatus> {
        match self.transitions.get(&(from, action.clone())) {
            Some(to) => Ok(*to),
            None => Err(LisError::InvalidStateTransition {
                from: format!("{:?}", from),
                action: format!("{:?}", action),
            }),
        }
    }

    /// 获取某状态下所有可执行动作
    pub fn possible_actions(&self, current: OrderStatus) -> Vec<OrderAction> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, action)| action.clone())
            .collect()
    }
}

impl Default for OrderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let sm = OrderStateMachine::new();

        assert!(sm.can_transition(OrderStatus::Pending, &OrderAction::Collect));
        assert!(sm.can_transition(OrderStatus::Processing, &OrderAction::AllResulted));
        assert!(sm.can_transition(OrderStatus::PendingApproval, &OrderAction::FinalApprove));
        assert!(sm.can_transition(OrderStatus::Approved, &OrderAction::CancelApproval));
        assert!(sm.can_transition(OrderStatus::Approved, &OrderAction::Rerun));
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = OrderStateMachine::new();

        // 未采样不能直接审核
        assert!(!sm.can_transition(OrderStatus::Pending, &OrderAction::FinalApprove));
        // 终态不可离开
        assert!(!sm.can_transition(OrderStatus::Cancelled, &OrderAction::Collect));
        assert!(!sm.can_transition(OrderStatus::Cancelled, &OrderAction::FinalApprove));
        // 已审核医嘱不能再取消
        assert!(!sm.can_transition(OrderStatus::Approved, &OrderAction::Cancel));
    }

    #[test]
    fn test_transition_execution() {
        let sm = OrderStateMachine::new();

        let result = sm.transition(OrderStatus::PendingApproval, &OrderAction::Rerun);
        assert_eq!(result.unwrap(), OrderStatus::Processing);

        let result = sm.transition(OrderStatus::Approved, &OrderAction::FinalApprove);
        assert!(result.is_err());
    }
}
