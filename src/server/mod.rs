mod server;
mod stop;

pub(crate) use server::RpcServer;
pub(crate) use stop::listener_stop;
pub(crate) use stop::ListenerStop;
