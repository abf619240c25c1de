use actix_web::{web, App, HttpServer};
use interview_perf::config::PerfConfig;
use interview_perf::monitoring::handlers::register_routes;
use interview_perf::PerfContext;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = PerfConfig::from_env();
    tracing::info!(addr = %config.api.bind_addr(), "starting performance layer");

    let ctx = PerfContext::new(&config);
    let background = ctx.start_background();

    let data = web::Data::new(ctx.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(register_routes)
    })
    .bind(config.api.bind_addr())?
    .run();

    let result = server.await;

    ctx.shutdown();
    for handle in background {
        handle.abort();
    }
    result
}
