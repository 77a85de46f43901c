//! Core routing state: models, endpoints and their groups.

pub mod endpoint_group;
pub mod label_selector;
pub mod load_balancer;
pub mod model;
pub mod model_client;

pub use endpoint_group::{Endpoint, EndpointGroup, EndpointSpec, InFlightGuard};
pub use load_balancer::LoadBalancer;
pub use model::{LoadBalancing, Model, ModelDescriptor};
pub use model_client::{KubeModelClient, ModelClient, StaticModelClient};
