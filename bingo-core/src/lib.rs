mod client;
mod mutation;

pub use client::{
    ApiErrorClass, BingoClient, BingoError, Delivery, MutationResponse, RemoteStatus,
    classify_api_status,
};
pub use mutation::{MutationKind, Payload, UnknownKind};
