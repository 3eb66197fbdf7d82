mod api;

pub use api::{GreetingRequest, GreetingResponse, HealthResponse, MeResponse};
