pub mod analytics;
pub mod gateway;
pub mod health;

pub use analytics::create_analytics_routes;
pub use gateway::create_gateway_routes;
pub use health::create_health_routes;
