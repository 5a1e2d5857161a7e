//! Types shared by the mtrcs agent and collector server.

pub mod crypto;
pub mod shutdown;
pub mod sign;
pub mod types;

pub mod proto {
    #![allow(clippy::pedantic)]
    #![allow(clippy::missing_errors_doc)]
    #![allow(clippy::doc_markdown)]
    #![allow(clippy::default_trait_access)]
    tonic::include_proto!("mtrcs");
}
