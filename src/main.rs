use std::net::SocketAddr;

use axum::{routing, Router};
use fast_trust::app::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "fast_trust=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_state = AppState::new_from_env().await.unwrap();
    app_state.run_migration().await.unwrap();

    use fast_trust::api::v1::{parcel, payment, rider, user};

    let parcels = Router::new()
        .route("/", routing::get(parcel::index))
        .route("/", routing::post(parcel::create))
        .route("/user", routing::get(parcel::user_index))
        .route("/rider", routing::get(parcel::rider_index))
        .route("/admin", routing::get(parcel::admin_index))
        .route("/track/:tracking_id", routing::get(parcel::track))
        .route("/:id", routing::get(parcel::show))
        .route("/:id", routing::delete(parcel::delete))
        .route("/:id/assign", routing::patch(parcel::assign))
        .route("/:id/unassign", routing::patch(parcel::unassign))
        .route("/:id/status", routing::patch(parcel::update_status));

    let riders = Router::new()
        .route("/", routing::post(rider::apply))
        .route("/pending", routing::get(rider::pending))
        .route("/active", routing::get(rider::active))
        .route("/me", routing::get(rider::me))
        .route("/:id/approve", routing::patch(rider::approve))
        .route("/:id/reject", routing::patch(rider::reject))
        .route("/:id/deactivate", routing::patch(rider::deactivate));

    let users = Router::new()
        .route("/", routing::post(user::login))
        .route("/search", routing::get(user::search))
        .route("/me", routing::get(user::me))
        .route("/:id/role", routing::patch(user::change_role));

    let payments = Router::new()
        .route("/", routing::get(payment::index))
        .route("/", routing::post(payment::confirm))
        .route(
            "/create-payment-intent",
            routing::post(payment::create_intent),
        );

    let app = Router::new()
        .route("/", routing::get(|| async { "Fast Trust server is running" }))
        .nest("/parcels", parcels)
        .nest("/riders", riders)
        .nest("/users", users)
        .nest("/payments", payments)
        .with_state(app_state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|it| it.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::debug!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
