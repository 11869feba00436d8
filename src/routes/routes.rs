//! Defines the HTTP surface of the store.
//!
//! ## Structure
//! - **Files**
//!   - `GET    /files?provider_id=`: list catalogued files
//!   - `DELETE /files`: delete every file
//!   - `POST   /files/{name}`: upload (`x-checksum`, `x-provider-id`, `x-image-type`)
//!   - `PUT    /files/{name}`: replace content of an available file
//!   - `GET    /files/{name}`: download
//!   - `DELETE /files/{name}`: delete one file
//!
//! - **Descriptors**
//!   - `GET    /vnfds`, `POST /vnfds`, `DELETE /vnfds`
//!   - `GET    /vnfds/{id}`, `PUT /vnfds/{id}`, `DELETE /vnfds/{id}`

use crate::handlers::{
    AppState,
    descriptor_handlers::{
        create_descriptor, delete_all_descriptors, delete_descriptor, get_descriptor,
        list_descriptors, modify_descriptor,
    },
    file_handlers::{
        delete_all_files, delete_file, download_file, list_files, update_file, upload_file,
    },
    health_handlers::{healthz, readyz},
};
use axum::{Router, routing::get};

/// Build the router; handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // files
        .route("/files", get(list_files).delete(delete_all_files))
        .route(
            "/files/{name}",
            get(download_file)
                .post(upload_file)
                .put(update_file)
                .delete(delete_file),
        )
        // descriptors
        .route(
            "/vnfds",
            get(list_descriptors)
                .post(create_descriptor)
                .delete(delete_all_descriptors),
        )
        .route(
            "/vnfds/{id}",
            get(get_descriptor)
                .put(modify_descriptor)
                .delete(delete_descriptor),
        )
}
