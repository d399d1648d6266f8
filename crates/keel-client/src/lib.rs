pub mod cleaner;
pub mod fetcher;
pub mod llm;

#[cfg(test)]
mod test_server;

pub use cleaner::HtmdCleaner;
pub use fetcher::ReqwestFetcher;
pub use llm::OpenAiInference;
