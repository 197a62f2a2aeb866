mod api;

pub use api::{
    AddTrustedIpRequest, HealthResponse, IdentifierResponse, IssueSessionRequest,
    IssuedSessionResponse, LiftBanResponse, LogoutAllResponse, SessionResponse,
    TrustCheckResponse, TrustedIpListResponse,
};
