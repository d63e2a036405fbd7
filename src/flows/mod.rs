//! Authorization Flows
//!
//! Authorization-code grant and refresh-token redemption against the
//! marketplace token endpoint.

pub mod authorization_code;

pub use authorization_code::{
    create_mock_authorization_code_flow, AuthorizationCodeFlow, AuthorizationCodeFlowImpl,
    MockAuthorizationCodeFlow,
};
