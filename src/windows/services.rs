//! Service control manager access

use std::ffi::OsStr;
use windows_service::service::{ServiceAccess, ServiceState};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use windows_service::Error as ServiceError;

use super::WindowsPlatform;
use crate::platform::{PlatformError, PlatformResult, ServiceControl};

fn service_error(name: &str, err: ServiceError) -> PlatformError {
    match err {
        ServiceError::Winapi(io) => match io.raw_os_error() {
            // ERROR_SERVICE_DOES_NOT_EXIST
            Some(1060) => PlatformError::NotFound(format!("service {}", name)),
            Some(5) => PlatformError::PermissionDenied(format!("service {}", name)),
            _ => PlatformError::IoError(format!("service {}: {}", name, io)),
        },
        other => PlatformError::IoError(format!("service {}: {}", name, other)),
    }
}

fn open(name: &str, access: ServiceAccess) -> PlatformResult<windows_service::service::Service> {
    let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
        .map_err(|e| service_error(name, e))?;
    manager.open_service(name, access).map_err(|e| service_error(name, e))
}

impl ServiceControl for WindowsPlatform {
    fn is_running(&self, name: &str) -> PlatformResult<bool> {
        let service = open(name, ServiceAccess::QUERY_STATUS)?;
        let status = service.query_status().map_err(|e| service_error(name, e))?;
        Ok(status.current_state == ServiceState::Running)
    }

    fn stop(&self, name: &str) -> PlatformResult<()> {
        let service = open(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)?;
        service.stop().map_err(|e| service_error(name, e))?;
        Ok(())
    }

    fn start(&self, name: &str) -> PlatformResult<()> {
        let service = open(name, ServiceAccess::START)?;
        service.start::<&OsStr>(&[]).map_err(|e| service_error(name, e))
    }
}
