// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

mod errors;

pub use self::errors::DeadlockError;
pub use self::errors::Error;
pub use self::errors::KeyExistsError;
pub use self::errors::Result;
pub use self::errors::WriteConflictError;
