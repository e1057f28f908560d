// Resolves with the first of the given futures to complete.
macro_rules! join_first {
    ($($e:expr),* $(,)?) => { tokio::select! {
        $(res = $e => res),+
    } };
}

pub(crate) use join_first;
