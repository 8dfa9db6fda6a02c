mod batches;
mod concurrency;
mod history;
mod links;
mod recovery;
