//! Route table assembly, one module per resource (spec §6), mirroring
//! `wirewarden-api::routes`'s per-resource `configure(cfg)` shape.

pub mod auth;
pub mod backup;
pub mod configs;
pub mod flow;
pub mod groups;
pub mod prewarm;
pub mod resolver;
pub mod settings;
pub mod stats;
pub mod update;
pub mod vpns;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    auth::configure(cfg);
    configs::configure(cfg);
    vpns::configure(cfg);
    groups::configure(cfg);
    resolver::configure(cfg);
    prewarm::configure(cfg);
    flow::configure(cfg);
    stats::configure(cfg);
    settings::configure(cfg);
    update::configure(cfg);
    backup::configure(cfg);
}
