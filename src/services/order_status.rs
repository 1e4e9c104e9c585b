use crate::entities::order::{self, OrderPaymentStatus, OrderStatus, RefundStatus};
use crate::entities::payment::PaymentStatus;

/// Forward-only order lifecycle. `Cancelled` is reachable from any state
/// that has not left the warehouse.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Pending, Cancelled)
            | (Processing, Shipped)
            | (Processing, Cancelled)
            | (Shipped, Delivered)
    )
}

pub fn is_valid_payment_transition(from: OrderPaymentStatus, to: OrderPaymentStatus) -> bool {
    use OrderPaymentStatus::*;
    matches!(
        (from, to),
        (Pending, Paid) | (Pending, Failed) | (Pending, Refunded) | (Failed, Paid) | (Paid, Refunded)
    )
}

/// Orders that have not shipped can still be cancelled by the customer.
pub fn is_cancellable(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Pending | OrderStatus::Processing)
}

/// Order header changes derived from one normalized vendor payment status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransition {
    pub payment_status: OrderPaymentStatus,
    pub status: OrderStatus,
    pub refund_status: Option<RefundStatus>,
    /// Set when the order moves into `Cancelled` and its stock must go back
    pub release_stock: bool,
}

impl PaymentTransition {
    /// True when applying this transition would leave the order untouched.
    pub fn is_noop(&self, order: &order::Model) -> bool {
        self.payment_status == order.payment_status
            && self.status == order.status
            && self.refund_status == order.refund_status
    }
}

/// Maps a vendor payment status onto the order. Targets that the state
/// machines reject keep the current value, so a late or out-of-order
/// notification can never move an order backwards. Returns `None` for
/// `Unknown`, which never touches the order.
pub fn plan_payment_transition(
    order: &order::Model,
    incoming: PaymentStatus,
) -> Option<PaymentTransition> {
    let (payment_target, status_target, mut refund_status) = match incoming {
        PaymentStatus::Paid => (OrderPaymentStatus::Paid, Some(OrderStatus::Processing), None),
        PaymentStatus::Pending | PaymentStatus::Processing => {
            (OrderPaymentStatus::Pending, Some(OrderStatus::Pending), None)
        }
        PaymentStatus::Failed | PaymentStatus::Cancelled => {
            (OrderPaymentStatus::Failed, Some(OrderStatus::Cancelled), None)
        }
        PaymentStatus::Refunded | PaymentStatus::Chargeback => (
            OrderPaymentStatus::Refunded,
            None,
            Some(RefundStatus::Completed),
        ),
        PaymentStatus::Unknown => return None,
    };

    let payment_status = if is_valid_payment_transition(order.payment_status, payment_target) {
        payment_target
    } else {
        order.payment_status
    };

    let status = match status_target {
        Some(target) if is_valid_transition(order.status, target) => target,
        _ => order.status,
    };

    // Money arrived for an order that was already cancelled.
    if payment_status == OrderPaymentStatus::Paid
        && order.payment_status != OrderPaymentStatus::Paid
        && order.status == OrderStatus::Cancelled
    {
        refund_status = Some(RefundStatus::Requested);
    }

    // A refund can only complete for money that was actually taken.
    if refund_status == Some(RefundStatus::Completed) && payment_status != OrderPaymentStatus::Refunded
    {
        refund_status = order.refund_status;
    }

    Some(PaymentTransition {
        payment_status,
        status,
        refund_status: refund_status.or(order.refund_status),
        release_stock: status == OrderStatus::Cancelled && order.status != OrderStatus::Cancelled,
    })
}
