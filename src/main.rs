#[tokio::main]
async fn main() {
    portknox_lib::run().await
}
