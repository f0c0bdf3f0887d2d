//! Remote-call surface for the Proxmox cluster-autoscaler provider
//!
//! This crate is the adapter layer between the autoscaler's externalgrpc
//! protocol and the orchestrator: statically-typed request/response records
//! mirroring the protocol schema, and the [`services::CloudProviderService`]
//! handlers a generated transport stub delegates to. Internal errors are
//! translated to gRPC status codes here and nowhere else.

pub mod proto;
pub mod services;

use proxmox_ca_domain::DomainError;
use tonic::Status;

/// Map a domain error onto the remote protocol's error taxonomy.
pub fn to_status(err: DomainError) -> Status {
    match err {
        DomainError::GroupNotFound { .. } | DomainError::NodeNotFound { .. } => {
            Status::not_found(err.to_string())
        }
        DomainError::OutOfRange { .. } => Status::out_of_range(err.to_string()),
        DomainError::Unavailable { .. } => Status::unavailable(err.to_string()),
        DomainError::Store(_) | DomainError::Internal { .. } => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn domain_errors_map_to_protocol_codes() {
        assert_eq!(
            to_status(DomainError::GroupNotFound {
                group_id: "web".into()
            })
            .code(),
            Code::NotFound
        );
        assert_eq!(
            to_status(DomainError::OutOfRange {
                message: "max exceeded".into()
            })
            .code(),
            Code::OutOfRange
        );
        assert_eq!(
            to_status(DomainError::Unavailable {
                message: "proxmox down".into()
            })
            .code(),
            Code::Unavailable
        );
        assert_eq!(
            to_status(DomainError::Internal {
                message: "bug".into()
            })
            .code(),
            Code::Internal
        );
    }
}
