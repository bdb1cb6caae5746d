use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::payment_handlers;
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn payment_routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/initiate", post(payment_handlers::initiate_payment))
        .route(
            "/status/:checkout_reference",
            get(payment_handlers::check_payment_status),
        )
        .route(
            "/invoice/:invoice_id",
            get(payment_handlers::list_invoice_payments),
        )
        .route("/:id", get(payment_handlers::get_payment))
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    // The callback stays outside the auth layer: the provider calls it
    // unauthenticated.
    Router::new()
        .route("/callback", post(payment_handlers::mpesa_callback))
        .merge(protected)
}
