// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! One-shot promise/future pairs used to park and resume drivers.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;

/// Fulfilling side of a [`ContinueFuture`].
#[derive(Debug)]
pub struct ContinuePromise {
    sender: oneshot::Sender<()>,
    name: &'static str,
}

/// Completes once the paired promise is fulfilled or dropped. A dropped promise
/// resumes the waiter too, which then re-checks the state it was waiting on.
#[derive(Debug)]
#[must_use = "a ContinueFuture does nothing unless waited on"]
pub struct ContinueFuture {
    receiver: oneshot::Receiver<()>,
}

pub fn make_continue_future(name: &'static str) -> (ContinuePromise, ContinueFuture) {
    let (sender, receiver) = oneshot::channel();
    (ContinuePromise { sender, name }, ContinueFuture { receiver })
}

impl ContinuePromise {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set_value(self) {
        // The waiter may have given up already.
        let _ = self.sender.send(());
    }
}

impl ContinueFuture {
    /// A future that is already complete.
    pub fn ready() -> Self {
        let (promise, future) = make_continue_future("ready");
        promise.set_value();
        future
    }

    /// Non-blocking completion check.
    pub fn is_ready(&mut self) -> bool {
        !matches!(self.receiver.try_recv(), Ok(None))
    }

    /// Blocks the calling thread until the future completes.
    pub fn wait(self) {
        futures::executor::block_on(self)
    }
}

impl Future for ContinueFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.receiver.poll_unpin(cx).map(|_| ())
    }
}
