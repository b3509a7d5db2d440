use axum::response::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct Welcome {
    message: &'static str,
}

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

pub async fn root() -> Json<Welcome> {
    Json(Welcome {
        message: "Welcome to Healthy-eye API",
    })
}

pub async fn healthcheck() -> Json<Health> {
    Json(Health {
        status: "Available",
    })
}
