use actix_web::{
    get,
    web::{self},
    HttpResponse, Result,
};

use crate::ws::handler;
use crate::HubHandle;

#[get("/ws")]
pub async fn websocket(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    hub: web::Data<HubHandle>,
) -> Result<HttpResponse, actix_web::Error> {
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // the handler runs detached so the upgrade response goes out immediately
    actix_web::rt::spawn(handler::handle_ws(
        hub.get_ref().clone(),
        session,
        msg_stream,
    ));

    Ok(res)
}
