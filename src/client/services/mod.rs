pub mod api_client;
pub mod chat_service;
pub mod conversation_service;
pub mod presence_service;
pub mod typing_service;
pub mod websocket_client;
