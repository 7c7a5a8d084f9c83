//! # SPI Protocol Library
//!
//! Wire-level pieces of the SPI point-of-sale to EFTPOS terminal protocol.
//! Everything here is synchronous and free of I/O; the `spi-client` crate
//! drives it over a WebSocket.
//!
//! ## Overview
//!
//! - **Message envelope**: JSON messages, sent plaintext during pairing and
//!   AES encrypted plus HMAC signed afterwards
//! - **Pairing**: a Diffie-Hellman handshake over the 2048-bit MODP group
//!   that yields the shared encryption and HMAC secrets
//! - **Key rolling**: secret rotation by hashing the current pair
//! - **Transactions**: request builders and response views for purchases,
//!   refunds, cashouts, MOTO, settlement, preauth and pay-at-table
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   purchase / settlement / preauth ...   │  request builders, response views
//! ├─────────────────────────────────────────┤
//! │          Message + events               │  JSON, event names, request ids
//! ├─────────────────────────────────────────┤
//! │        Envelope encryption              │  AES-CBC + HMAC-SHA256 (Secrets)
//! ├─────────────────────────────────────────┤
//! │       Transport (WebSocket text)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use spi_protocol::{Message, MessageStamp, ParseOutcome, PurchaseRequest, Secrets};
//!
//! let secrets = Secrets::new("AA".repeat(32), "BB".repeat(32)).unwrap();
//! let stamp = MessageStamp::new("POS1", Some(secrets.clone()));
//!
//! let request = PurchaseRequest::new(1000, "order-42").to_message();
//! let json = request.to_json(&stamp).unwrap();
//!
//! match Message::from_json(&json, Some(&secrets)) {
//!     ParseOutcome::Parsed(message) => assert_eq!(message.event_name, "purchase"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

pub mod cashout;
pub mod crypto;
pub mod diffie_hellman;
pub mod error;
pub mod key_rolling;
pub mod messages;
pub mod pairing;
pub mod pay_at_table;
pub mod ping;
pub mod preauth;
pub mod purchase;
pub mod secrets;
pub mod settlement;

pub use cashout::{CashoutOnlyRequest, CashoutOnlyResponse};
pub use error::{ProtocolError, Result};
pub use key_rolling::{perform_key_rolling, KeyRollingResult};
pub use messages::{
    events, format_cents, next_request_id, InboundEvent, Message, MessageData, MessageStamp,
    ParseOutcome, SuccessState,
};
pub use pairing::{
    generate_secrets_and_key_response, DropKeysRequest, KeyCheck, KeyRequest, KeyResponse,
    PairRequest, PairResponse, SecretsAndKeyResponse, CONFIRMATION_CODE_LENGTH,
};
pub use pay_at_table::{
    BillDetailsRequest, BillPayment, BillRetrievalResult, BillStatusResponse, PayAtTableConfig,
    PaymentHistoryEntry, PaymentType,
};
pub use ping::{ping_request, pong_response};
pub use preauth::{
    AccountVerifyRequest, AccountVerifyResponse, PreauthCancelRequest, PreauthCompletionRequest,
    PreauthExtendRequest, PreauthOpenRequest, PreauthPartialCancellationRequest,
    PreauthResponse, PreauthTopupRequest,
};
pub use purchase::{
    AuthCodeAdvice, CancelTransactionRequest, GetLastTransactionRequest,
    GetLastTransactionResponse, MotoPurchaseRequest, MotoPurchaseResponse, PhoneForAuthRequired,
    PurchaseRequest, PurchaseResponse, ReceiptOptions, RefundRequest, RefundResponse,
    SignatureAccept, SignatureDecline, SignatureRequired, TransactionResponse,
};
pub use secrets::Secrets;
pub use settlement::{SchemeSettlementEntry, SettleRequest, Settlement, SettlementEnquiryRequest};
