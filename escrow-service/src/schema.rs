diesel::table! {
    payments (id) {
        id -> Uuid,
        job_id -> Uuid,
        invoice_id -> Nullable<Uuid>,
        customer_id -> Uuid,
        mechanic_id -> Uuid,
        amount_cents -> Int8,
        fee_before_discount_cents -> Int8,
        platform_fee_cents -> Int8,
        mechanic_net_cents -> Int8,
        processor_hold_id -> Nullable<Varchar>,
        processor_charge_id -> Nullable<Varchar>,
        status -> Varchar,
        error_message -> Nullable<Varchar>,
        paid_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    promo_credits (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Varchar,
        remaining_uses -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    promo_applications (id) {
        id -> Uuid,
        payment_id -> Uuid,
        credit_id -> Uuid,
        discount_cents -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_events (event_id) {
        event_id -> Varchar,
        event_type -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    ledger_entries (id) {
        id -> Uuid,
        mechanic_id -> Uuid,
        payment_id -> Uuid,
        job_id -> Uuid,
        processor_account_id -> Varchar,
        amount_cents -> Int8,
        status -> Varchar,
        available_for_transfer_at -> Timestamptz,
        processor_transfer_id -> Nullable<Varchar>,
        transferred_at -> Nullable<Timestamptz>,
        processor_payout_id -> Nullable<Varchar>,
        paid_out_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    transfers (id) {
        id -> Uuid,
        mechanic_id -> Uuid,
        processor_account_id -> Varchar,
        processor_transfer_id -> Varchar,
        amount_cents -> Int8,
        status -> Varchar,
        ledger_entry_ids -> Array<Uuid>,
        error_message -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    invitations (id) {
        id -> Uuid,
        inviter_id -> Uuid,
        invited_id -> Uuid,
        invited_role -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    invitation_awards (id) {
        id -> Uuid,
        invitation_id -> Uuid,
        invited_id -> Uuid,
        payment_id -> Uuid,
        processor_event_id -> Varchar,
        award_kind -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    notifications (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Varchar,
        title -> Varchar,
        body -> Varchar,
        data -> Jsonb,
        published -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    promotions (id) {
        id -> Uuid,
        code -> Varchar,
        kind -> Varchar,
        description -> Nullable<Varchar>,
        percent_off -> Nullable<Int4>,
        amount_cents -> Nullable<Int8>,
        minimum_amount_cents -> Nullable<Int8>,
        max_redemptions -> Nullable<Int4>,
        max_redemptions_per_user -> Int4,
        current_redemptions -> Int4,
        active -> Bool,
        starts_at -> Timestamptz,
        ends_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    promotion_redemptions (id) {
        id -> Uuid,
        promotion_id -> Uuid,
        user_id -> Uuid,
        discount_cents -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    jobs (id) {
        id -> Uuid,
        customer_id -> Uuid,
        mechanic_id -> Nullable<Uuid>,
        title -> Varchar,
        status -> Varchar,
        mechanic_verified_at -> Nullable<Timestamptz>,
        customer_verified_at -> Nullable<Timestamptz>,
        paid_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    job_invoices (id) {
        id -> Uuid,
        job_id -> Uuid,
        status -> Varchar,
        total_cents -> Int8,
        platform_fee_cents -> Int8,
        mechanic_net_cents -> Int8,
        paid_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    job_contracts (id) {
        id -> Uuid,
        job_id -> Uuid,
        customer_id -> Uuid,
        mechanic_id -> Uuid,
        status -> Varchar,
        total_cents -> Int8,
        platform_fee_cents -> Int8,
        processor_hold_id -> Nullable<Varchar>,
        payment_authorized_at -> Nullable<Timestamptz>,
        payment_captured_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    mechanic_accounts (mechanic_id) {
        mechanic_id -> Uuid,
        processor_account_id -> Varchar,
        onboarding_completed -> Bool,
        charges_enabled -> Bool,
        payouts_enabled -> Bool,
        details_submitted -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    payments,
    promo_credits,
    promo_applications,
    webhook_events,
    ledger_entries,
    transfers,
    invitations,
    invitation_awards,
    notifications,
    promotions,
    promotion_redemptions,
    jobs,
    job_invoices,
    job_contracts,
    mechanic_accounts,
);
