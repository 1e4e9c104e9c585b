use crate::entities::payment::PaymentStatus;

/// Maps any vendor status string onto the internal vocabulary.
///
/// Matching ignores case, surrounding whitespace and the separator style
/// (`in-process`, `in process` and `in_process` are the same). Anything not
/// in the table is `Unknown`; this function never fails.
pub fn normalize_status(vendor_status: &str) -> PaymentStatus {
    let key: String = vendor_status
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();

    match key.as_str() {
        "approved" | "paid" | "authorized" | "accredited" | "succeeded" | "success"
        | "completed" | "captured" => PaymentStatus::Paid,
        "pending" | "in_process" | "in_mediation" | "waiting" | "waiting_payment" | "created"
        | "open" => PaymentStatus::Pending,
        "processing" | "in_progress" | "under_review" => PaymentStatus::Processing,
        "rejected" | "failed" | "declined" | "denied" | "error" | "expired" => {
            PaymentStatus::Failed
        }
        "cancelled" | "canceled" | "voided" => PaymentStatus::Cancelled,
        "refunded" | "partially_refunded" => PaymentStatus::Refunded,
        "charged_back" | "chargeback" | "disputed" => PaymentStatus::Chargeback,
        _ => PaymentStatus::Unknown,
    }
}
