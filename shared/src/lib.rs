pub mod money;
pub mod processor;
pub mod status;

pub use money::{Cents, MoneyError, CURRENCY};
pub use processor::{
    ConnectedAccount, Dispute, EventData, Hold, HoldRequest, PaymentMethodRef, Payout,
    ProcessorCharge, ProcessorEvent, Transfer, TransferRequest,
};
pub use status::{
    ContractStatus, CreditKind, LedgerStatus, ParseStatusError, PaymentStatus, PromotionKind,
};
