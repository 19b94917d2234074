// Schema profiles - the two systems' vocabularies as data.
//
// The source and target instances name the same business concepts
// differently (field renames, collapsed fields, version drift). Instead of
// scattering conditionals through query construction, each side carries a
// profile struct and the engine reads names from it. Capability flags cover
// structural drift such as company scoping disappearing from an entity.

use serde::Serialize;

/// Vocabulary of the source (read-only) system.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSchema {
    pub transaction_entity: String,
    pub line_entity: String,
    pub payment_entity: String,
    pub settlement_entity: String,
    pub journal_entity: String,
    pub account_entity: String,
    pub tax_entity: String,

    /// Field holding the transaction's document type.
    pub type_field: String,

    /// Payment date field (renamed on the target).
    pub payment_date_field: String,

    /// Flag separating principal invoice lines from automatic ones.
    pub invoice_tab_flag: String,

    /// Custom party-role field on invoice lines, distinct from the party.
    pub party_role_field: String,

    /// Dual default-account fields on journals.
    pub default_debit_account_field: String,
    pub default_credit_account_field: String,
}

impl Default for SourceSchema {
    fn default() -> Self {
        SourceSchema {
            transaction_entity: "account.move".to_string(),
            line_entity: "account.move.line".to_string(),
            payment_entity: "account.payment".to_string(),
            settlement_entity: "account.partial.reconcile".to_string(),
            journal_entity: "account.journal".to_string(),
            account_entity: "account.account".to_string(),
            tax_entity: "account.tax".to_string(),
            type_field: "type".to_string(),
            payment_date_field: "payment_date".to_string(),
            invoice_tab_flag: "exclude_from_invoice_tab".to_string(),
            party_role_field: "user".to_string(),
            default_debit_account_field: "default_debit_account_id".to_string(),
            default_credit_account_field: "default_credit_account_id".to_string(),
        }
    }
}

/// Vocabulary and capabilities of the target (read-write) system.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSchema {
    pub transaction_entity: String,
    pub line_entity: String,
    pub payment_entity: String,
    pub journal_entity: String,
    pub account_entity: String,
    pub tax_entity: String,
    pub currency_entity: String,

    /// Field holding the transaction's document type.
    pub type_field: String,

    /// Custom field stamped on target records pointing back at the source
    /// record they were derived from.
    pub back_reference_field: String,

    /// Single default-account field journals carry on the target.
    pub default_account_field: String,

    /// Party-role field on lines, counterpart of the source's custom field.
    pub party_role_field: String,

    /// Helper entity whose operation wraps transaction creation so it stays
    /// callable over the RPC boundary.
    pub creation_helper_entity: String,
    pub creation_helper_operation: String,

    /// State transition to posted/confirmed.
    pub post_operation: String,

    /// Debit/credit settlement operation on lines.
    pub settle_operation: String,

    pub payment_date_field: String,
    pub payment_move_field: String,

    /// Line classification used by the settlement fallback search.
    pub account_type_field: String,
    pub receivable_account_type: String,
    pub payable_account_type: String,
    pub residual_field: String,
    pub settled_flag: String,

    /// Whether target accounts carry a company field. When false, account
    /// reads must go out unfiltered (version drift, not an error).
    pub company_scoped_accounts: bool,
}

impl Default for TargetSchema {
    fn default() -> Self {
        TargetSchema {
            transaction_entity: "account.move".to_string(),
            line_entity: "account.move.line".to_string(),
            payment_entity: "account.payment".to_string(),
            journal_entity: "account.journal".to_string(),
            account_entity: "account.account".to_string(),
            tax_entity: "account.tax".to_string(),
            currency_entity: "res.currency".to_string(),
            type_field: "move_type".to_string(),
            back_reference_field: "x_v13_id".to_string(),
            default_account_field: "default_account_id".to_string(),
            party_role_field: "final_user_id".to_string(),
            creation_helper_entity: "migration.helper".to_string(),
            creation_helper_operation: "create_invoice_xmlrpc".to_string(),
            post_operation: "action_post".to_string(),
            settle_operation: "reconcile".to_string(),
            payment_date_field: "date".to_string(),
            payment_move_field: "move_id".to_string(),
            account_type_field: "account_type".to_string(),
            receivable_account_type: "asset_receivable".to_string(),
            payable_account_type: "liability_payable".to_string(),
            residual_field: "amount_residual".to_string(),
            settled_flag: "reconciled".to_string(),
            company_scoped_accounts: false,
        }
    }
}

// ============================================================================
// ENTITY KINDS (mapping store vocabulary)
// ============================================================================

/// Neutral entity-kind names used as keys in the mapping store, independent
/// of either system's model names.
pub mod kind {
    pub const PARTNER: &str = "partner";
    pub const PRODUCT: &str = "product";
    pub const INVOICE: &str = "invoice";
    pub const LEDGER_ENTRY: &str = "ledger_entry";
    pub const PAYMENT: &str = "payment";
    pub const JOURNAL: &str = "journal";
    pub const TAX: &str = "tax";
    pub const ACCOUNT: &str = "account";
}
