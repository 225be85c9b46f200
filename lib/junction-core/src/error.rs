use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance {instance_id} of service {service} is already registered at a different address")]
    DuplicateInstance { service: String, instance_id: String },

    #[error("no active lease for instance {instance_id} of service {service}")]
    NotFound { service: String, instance_id: String },
}
