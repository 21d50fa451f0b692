use actix_web::Scope;

use crate::rest;

/// Registers the task and image endpoints on an API scope.
pub fn extend_web_scope(scope: Scope) -> Scope {
    let scope = rest::control::extend_web_scope(scope);
    let scope = rest::state::extend_web_scope(scope);
    rest::images::extend_web_scope(scope)
}
