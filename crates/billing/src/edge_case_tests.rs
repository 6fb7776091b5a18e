// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Lifecycle
//!
//! End-to-end paths through checkout, webhooks, deferred changes and the sweep:
//! - Pending invoice uniqueness
//! - Webhook idempotence and ordering
//! - Upgrade immediacy and downgrade deferral
//! - Seat-cap safety when committing pending changes
//! - Time boundaries

#[cfg(test)]
mod pending_invoice_tests {
    use crate::error::BillingError;
    use crate::test_support::Harness;
    use hrcore_shared::InvoiceStatus;
    use time::Duration;
    use uuid::Uuid;

    // =========================================================================
    // Double-clicked checkout: second request is refused, nothing is billed twice
    // =========================================================================
    #[tokio::test]
    async fn test_second_checkout_refused_while_first_pending() {
        let h = Harness::new();
        let company = Uuid::new_v4();

        let first = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();
        let second = h.billing.subscriptions.checkout(company, "starter", None).await;

        assert!(matches!(
            second,
            Err(BillingError::DuplicatePendingInvoice { company_id }) if company_id == company
        ));
        assert_eq!(h.provider.requests().len(), 1, "Provider must be called once");
        let pending = h.billing.invoices.find_pending(company).await.unwrap().unwrap();
        assert_eq!(pending.id, first.id);
    }

    // =========================================================================
    // Concurrent checkouts: exactly one pending invoice survives
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_checkouts_leave_one_pending_invoice() {
        let h = Harness::new();
        let company = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let billing = h.billing.clone();
            handles.push(tokio::spawn(async move {
                billing.subscriptions.checkout(company, "basic", None).await
            }));
        }

        let mut created = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(BillingError::DuplicatePendingInvoice { .. }) => duplicates += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(duplicates, 7);
        let invoices = h.billing.invoices.get_invoices(company).await.unwrap();
        let pending = invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Pending)
            .count();
        assert_eq!(pending, 1);
    }

    // =========================================================================
    // Provider failure does not leave a pending invoice blocking the retry
    // =========================================================================
    #[tokio::test]
    async fn test_provider_failure_frees_the_pending_slot() {
        let h = Harness::new();
        let company = Uuid::new_v4();

        h.provider.fail_next_calls("amount below minimum");
        let result = h.billing.subscriptions.checkout(company, "basic", None).await;
        assert!(matches!(result, Err(BillingError::ProviderRejected(_))));
        assert!(h.billing.invoices.find_pending(company).await.unwrap().is_none());

        h.provider.recover();
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "basic", None)
            .await
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
    }

    // =========================================================================
    // Abandoned payment: stale invoice expires, a new checkout is possible
    // =========================================================================
    #[tokio::test]
    async fn test_stale_invoice_expired_then_new_checkout_allowed() {
        let h = Harness::new();
        let company = Uuid::new_v4();
        let stale = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();

        h.clock.advance(Duration::hours(25));
        let report = h.billing.sweeper.run_sweep().await;
        assert_eq!(report.invoices_expired, 1);
        assert_eq!(h.invoice(stale.id).await.status, InvoiceStatus::Expired);

        let fresh = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();
        assert_ne!(fresh.id, stale.id);
        assert_eq!(fresh.status, InvoiceStatus::Pending);
    }

    // =========================================================================
    // Cancelling a pending invoice by hand
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_pending_invoice_is_idempotent_and_scoped() {
        let h = Harness::new();
        let company = Uuid::new_v4();
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "basic", None)
            .await
            .unwrap();

        let other_company = Uuid::new_v4();
        assert!(matches!(
            h.billing
                .invoices
                .cancel_pending_invoice(other_company, invoice.id)
                .await,
            Err(BillingError::NotFound(_))
        ));

        let cancelled = h
            .billing
            .invoices
            .cancel_pending_invoice(company, invoice.id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
        let again = h
            .billing
            .invoices
            .cancel_pending_invoice(company, invoice.id)
            .await
            .unwrap();
        assert_eq!(again.status, InvoiceStatus::Cancelled);
    }
}

#[cfg(test)]
mod webhook_tests {
    use crate::clock::Clock;
    use crate::events::BillingEventType;
    use crate::test_support::Harness;
    use crate::webhooks::WebhookOutcome;
    use hrcore_shared::{InvoiceStatus, SubscriptionStatus};
    use time::Duration;
    use uuid::Uuid;

    // =========================================================================
    // New company checks out Starter, provider reports it paid
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_paid_activates_subscription() {
        let h = Harness::new();
        let company = Uuid::new_v4();
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.amount, 25_000);
        assert!(h.billing.subscriptions.get_subscription(company).await.unwrap().is_none());

        let outcome = h.webhook(&invoice, "PAID").await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                invoice_id: invoice.id
            }
        );

        let sub = h.subscription(company).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan_id, "starter");
        assert_eq!(sub.max_seats, 10);
        assert_eq!(sub.period_end - sub.period_start, Duration::days(30));

        let stored = h.invoice(invoice.id).await;
        assert_eq!(stored.status, InvoiceStatus::Paid);
        assert_eq!(stored.subscription_id, Some(sub.id));
        assert_eq!(stored.payment_method.as_deref(), Some("BANK_TRANSFER"));
    }

    // =========================================================================
    // Same paid webhook delivered twice: one ledger mutation, paid_at kept
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_paid_webhook_applies_once() {
        let h = Harness::new();
        let company = h.active_company("basic").await;
        let invoice = h
            .billing
            .subscriptions
            .upgrade_plan(company, "pro")
            .await
            .unwrap();

        h.webhook(&invoice, "PAID").await.unwrap();
        let after_first = h.subscription(company).await;
        let paid_at = h.invoice(invoice.id).await.paid_at;
        assert!(paid_at.is_some());

        h.clock.advance(Duration::hours(1));
        let outcome = h.webhook(&invoice, "PAID").await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::AlreadyProcessed {
                invoice_id: invoice.id
            }
        );

        let after_second = h.subscription(company).await;
        assert_eq!(after_first, after_second);
        assert_eq!(after_first.version, after_second.version);
        assert_eq!(h.invoice(invoice.id).await.paid_at, paid_at);

        let upgrades = h
            .billing
            .events
            .list_for_company(company)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == BillingEventType::PlanUpgraded)
            .count();
        assert_eq!(upgrades, 1);
    }

    // =========================================================================
    // Concurrent deliveries of the same paid event serialize on the invoice
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_paid_webhooks_apply_once() {
        let h = Harness::new();
        let company = Uuid::new_v4();
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "id": invoice.provider_invoice_id.clone().unwrap(),
            "status": "PAID",
        }))
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let billing = h.billing.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                billing
                    .webhooks
                    .handle(Some(crate::test_support::CALLBACK_TOKEN), &body)
                    .await
            }));
        }

        let mut applied = 0;
        let mut repeated = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                WebhookOutcome::Applied { .. } => applied += 1,
                WebhookOutcome::AlreadyProcessed { .. } => repeated += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(repeated, 5);
        assert_eq!(h.subscription(company).await.version, 0);
    }

    // =========================================================================
    // Paid webhook without paid_at falls back to the receive time
    // =========================================================================
    #[tokio::test]
    async fn test_paid_without_timestamp_uses_receive_time() {
        let h = Harness::new();
        let company = Uuid::new_v4();
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "basic", None)
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(10));

        let body = serde_json::to_vec(&serde_json::json!({
            "provider_invoice_id": invoice.provider_invoice_id.clone().unwrap(),
            "event_type": "paid",
        }))
        .unwrap();
        h.billing
            .webhooks
            .handle(Some(crate::test_support::CALLBACK_TOKEN), &body)
            .await
            .unwrap();

        let stored = h.invoice(invoice.id).await;
        assert_eq!(stored.paid_at, Some(h.clock.now()));
        assert_eq!(h.subscription(company).await.period_start, h.clock.now());
    }

    // =========================================================================
    // Unrecognized event types are acknowledged without touching the invoice
    // =========================================================================
    #[tokio::test]
    async fn test_unrecognized_event_ignored() {
        let h = Harness::new();
        let company = Uuid::new_v4();
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "basic", None)
            .await
            .unwrap();

        let outcome = h.webhook(&invoice, "PENDING").await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(h.invoice(invoice.id).await.status, InvoiceStatus::Pending);
    }
}

#[cfg(test)]
mod plan_change_tests {
    use crate::error::BillingError;
    use crate::scheduler::StuckPendingChange;
    use crate::test_support::{at, Harness};
    use hrcore_shared::SubscriptionStatus;
    use time::Duration;

    // =========================================================================
    // Upgrade then paid: plan changes now, nothing pending, same period kept
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_applies_immediately_on_payment() {
        let h = Harness::new();
        let company = h.active_company("basic").await;
        h.clock.advance(Duration::days(10));

        let invoice = h
            .billing
            .subscriptions
            .upgrade_plan(company, "pro")
            .await
            .unwrap();
        assert_eq!(h.subscription(company).await.plan_id, "basic");

        h.webhook(&invoice, "PAID").await.unwrap();
        let sub = h.subscription(company).await;
        assert_eq!(sub.plan_id, "pro");
        assert_eq!(sub.max_seats, 25);
        assert_eq!(sub.pending_plan_id, None);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.period_end >= at(30));
        assert!(h.billing.access.has_feature(company, "payroll").await.unwrap());
    }

    // =========================================================================
    // Downgrade requested five days before period end, swept a day after
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_committed_after_period_end() {
        let h = Harness::new();
        let company = h.active_company("starter").await;
        assert_eq!(h.subscription(company).await.period_end, at(30));

        h.clock.set(at(25));
        let sub = h
            .billing
            .subscriptions
            .downgrade_plan(company, "basic")
            .await
            .unwrap();
        assert_eq!(sub.plan_id, "starter");
        assert_eq!(sub.pending_plan_id.as_deref(), Some("basic"));
        assert!(h.billing.access.has_feature(company, "leave").await.unwrap());

        h.clock.set(at(29));
        let report = h.billing.sweeper.run_sweep().await;
        assert_eq!(report.changes_committed, 0);

        h.clock.set(at(31));
        let report = h.billing.sweeper.run_sweep().await;
        assert_eq!(report.changes_committed, 1);
        assert!(report.is_clean());

        let sub = h.subscription(company).await;
        assert_eq!(sub.plan_id, "basic");
        assert_eq!(sub.pending_plan_id, None);
        assert_eq!(sub.max_seats, 5);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.period_start, at(30));
        assert_eq!(sub.period_end, at(60));
        assert!(!h.billing.access.has_feature(company, "leave").await.unwrap());
    }

    // =========================================================================
    // Seat-cap safety: headcount above the pending cap refuses the commit
    // =========================================================================
    #[tokio::test]
    async fn test_seat_decrease_refused_when_headcount_too_high() {
        let h = Harness::new();
        let company = h.active_company("starter").await;
        h.employees.set(company, 3);
        h.billing
            .subscriptions
            .change_seats(company, 4)
            .await
            .unwrap();

        // Headcount grows after the decrease was scheduled
        h.employees.set(company, 8);
        h.clock.set(at(31));
        let report = h.billing.sweeper.run_sweep().await;

        assert_eq!(report.changes_committed, 0);
        let sub = h.subscription(company).await;
        assert_eq!(
            report.stuck_pending,
            vec![StuckPendingChange {
                subscription_id: sub.id,
                company_id: company,
                pending_plan_id: None,
                pending_max_seats: Some(4),
                active_employees: 8,
                new_max_seats: 4,
            }]
        );
        assert!(!report.is_clean());
        assert_eq!(sub.pending_max_seats, Some(4));
        assert_eq!(sub.max_seats, 10);
        assert_eq!(sub.plan_id, "starter");
    }

    // =========================================================================
    // Downgrade whose included seats cannot hold the current headcount
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_refused_then_committed_once_headcount_drops() {
        let h = Harness::new();
        let company = h.active_company("starter").await;
        h.employees.set(company, 4);
        h.billing
            .subscriptions
            .downgrade_plan(company, "basic")
            .await
            .unwrap();

        // A day past the boundary, so the same sweep also lapses the period
        h.employees.set(company, 7);
        h.clock.set(at(31));
        let report = h.billing.sweeper.run_sweep().await;
        assert_eq!(report.stuck_pending.len(), 1);
        assert_eq!(report.changes_committed, 0);
        let sub = h.subscription(company).await;
        assert_eq!(sub.plan_id, "starter");
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.pending_plan_id.as_deref(), Some("basic"));

        // The next sweep retries once the company is back under the cap
        h.employees.set(company, 3);
        h.clock.advance(Duration::minutes(5));
        let report = h.billing.sweeper.run_sweep().await;
        assert_eq!(report.changes_committed, 1);
        assert!(report.stuck_pending.is_empty());
        assert!(report.failures.is_empty());

        let sub = h.subscription(company).await;
        assert_eq!(sub.plan_id, "basic");
        assert_eq!(sub.max_seats, 5);
        assert_eq!(sub.pending_plan_id, None);
        // A lapsed subscription does not roll into an unpaid period
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.period_end, at(30));
    }

    // =========================================================================
    // Downgrade target must be a lower tier
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_to_higher_or_same_tier_rejected() {
        let h = Harness::new();
        let company = h.active_company("starter").await;

        for target in ["pro", "starter"] {
            let result = h.billing.subscriptions.downgrade_plan(company, target).await;
            assert!(
                matches!(result, Err(BillingError::InvalidPlanChange(_))),
                "downgrade to {} should be rejected",
                target
            );
        }
        assert!(!h.subscription(company).await.has_pending_change());
    }

    // =========================================================================
    // Cancel keeps access until period end, then the sweep expires it
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_keeps_access_until_period_end() {
        let h = Harness::new();
        let company = h.active_company("starter").await;
        h.billing
            .subscriptions
            .downgrade_plan(company, "basic")
            .await
            .unwrap();

        h.clock.set(at(5));
        let sub = h
            .billing
            .subscriptions
            .cancel_subscription(company)
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert_eq!(sub.period_end, at(30));
        assert!(!sub.has_pending_change());

        h.clock.set(at(29));
        assert!(h.billing.access.get_access(company).await.unwrap().allowed);
        h.billing.sweeper.run_sweep().await;
        assert_eq!(h.subscription(company).await.status, SubscriptionStatus::Cancelled);

        h.clock.set(at(30));
        assert!(!h.billing.access.get_access(company).await.unwrap().allowed);
        h.clock.advance(Duration::seconds(1));
        h.billing.sweeper.run_sweep().await;
        assert_eq!(h.subscription(company).await.status, SubscriptionStatus::Expired);
    }
}

#[cfg(test)]
mod time_boundary_tests {
    use crate::test_support::{at, Harness};
    use hrcore_shared::SubscriptionStatus;
    use time::Duration;

    // =========================================================================
    // Access ends exactly at period_end, not one tick later
    // =========================================================================
    #[tokio::test]
    async fn test_access_ends_at_period_end() {
        let h = Harness::new();
        let company = h.active_company("basic").await;

        h.clock.set(at(30) - Duration::seconds(1));
        assert!(h.billing.access.can_add_employee(company).await.unwrap());
        h.clock.set(at(30));
        assert!(!h.billing.access.can_add_employee(company).await.unwrap());
    }

    // =========================================================================
    // Renewal before period end stacks the new period on the old one
    // =========================================================================
    #[tokio::test]
    async fn test_early_renewal_extends_from_period_end() {
        let h = Harness::new();
        let company = h.active_company("basic").await;

        h.clock.set(at(28));
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "basic", None)
            .await
            .unwrap();
        h.pay(&invoice).await;

        let sub = h.subscription(company).await;
        assert_eq!(sub.period_start, at(30));
        assert_eq!(sub.period_end, at(60));
    }

    // =========================================================================
    // Re-subscribing after a cancel keeps the time already paid for
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_after_cancel_keeps_prepaid_period() {
        let h = Harness::new();
        let company = h.active_company("starter").await;

        h.clock.set(at(5));
        let renewal = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();
        h.pay(&renewal).await;
        assert_eq!(h.subscription(company).await.period_end, at(60));

        h.clock.set(at(6));
        h.billing
            .subscriptions
            .cancel_subscription(company)
            .await
            .unwrap();

        h.clock.set(at(7));
        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();
        h.pay(&invoice).await;

        let sub = h.subscription(company).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan_id, "starter");
        assert_eq!(sub.period_start, at(60));
        assert_eq!(sub.period_end, at(90));
    }

    // =========================================================================
    // Past-due company pays within the grace window and is active again
    // =========================================================================
    #[tokio::test]
    async fn test_past_due_recovers_on_payment() {
        let h = Harness::new();
        let company = h.active_company("starter").await;

        h.clock.set(at(32));
        h.billing.sweeper.run_sweep().await;
        assert_eq!(h.subscription(company).await.status, SubscriptionStatus::PastDue);

        let invoice = h
            .billing
            .subscriptions
            .checkout(company, "starter", None)
            .await
            .unwrap();
        h.pay(&invoice).await;

        let sub = h.subscription(company).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.period_start, at(32));
        assert_eq!(sub.period_end, at(62));
        h.billing.sweeper.run_sweep().await;
        assert_eq!(h.subscription(company).await.status, SubscriptionStatus::Active);
    }
}
