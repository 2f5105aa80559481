pub mod model;

pub use model::{
    CredentialProvider, CredentialRequest, Credentials, ExpirationTime, ResponseMetadata,
};
