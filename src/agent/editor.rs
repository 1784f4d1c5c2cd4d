//! The foreign-side editor window. Created while serving `effEditOpen`,
//! shown on `SHOW_WINDOW`, hidden (not destroyed) when the user closes it,
//! destroyed on `effEditClose`. The handle exchanged with the shim is the
//! identifier the external binary-compatibility layer associates with the
//! native window object; everything else about embedding is opaque to the
//! bridge.

use crate::vst2::ERect;
use std::os::raw::c_void;

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        use parking_lot::Once;
        use windows::core::PCSTR;
        use windows::Win32::Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
        use windows::Win32::Graphics::Gdi::UpdateWindow;
        use windows::Win32::System::LibraryLoader::GetModuleHandleA;
        use windows::Win32::UI::WindowsAndMessaging::{
            CreateWindowExA, DefWindowProcA, DestroyWindow, DispatchMessageA, GetPropA,
            GetQueueStatus, PeekMessageA, RegisterClassExA, ShowWindow, HMENU, MSG,
            PM_REMOVE, QS_ALLINPUT, SW_HIDE, SW_SHOWNORMAL, WM_CLOSE, WNDCLASSEXA, WS_EX_TOOLWINDOW,
            WS_POPUP,
        };

        const WINDOW_CLASS: &[u8] = b"VST2-BRIDGE\0";
        static REGISTER_CLASS: Once = Once::new();

        /// A hidden popup window the compatibility layer pairs with a
        /// native-side window object; the plugin draws into it.
        pub(super) struct EditorWindow {
            hwnd: Option<HWND>,
        }

        impl EditorWindow {
            pub fn new() -> Self {
                Self { hwnd: None }
            }

            /// Create the window if needed and resolve the identifier the
            /// compatibility layer ties to it. Returns 0 on failure.
            pub fn open(&mut self, rect: Option<ERect>) -> isize {
                if self.hwnd.is_none() {
                    REGISTER_CLASS.call_once(|| {
                        let class = WNDCLASSEXA {
                            cbSize: std::mem::size_of::<WNDCLASSEXA>() as u32,
                            lpfnWndProc: Some(window_proc),
                            hInstance: unsafe { GetModuleHandleA(PCSTR(std::ptr::null())) }
                                .unwrap_or(HINSTANCE(0)),
                            lpszClassName: PCSTR(WINDOW_CLASS.as_ptr()),
                            ..Default::default()
                        };
                        if unsafe { RegisterClassExA(&class) } == 0 {
                            bridge_error!("failed to register the editor window class");
                        }
                    });

                    let (width, height) = match rect {
                        Some(rect) => (
                            (rect.right - rect.left).max(1) as i32,
                            (rect.bottom - rect.top).max(1) as i32,
                        ),
                        None => (640, 480),
                    };

                    let hwnd = unsafe {
                        CreateWindowExA(
                            WS_EX_TOOLWINDOW,
                            PCSTR(WINDOW_CLASS.as_ptr()),
                            PCSTR(b"Plugin\0".as_ptr()),
                            WS_POPUP,
                            0,
                            0,
                            width,
                            height,
                            HWND(0),
                            HMENU(0),
                            HINSTANCE(0),
                            None,
                        )
                    };
                    if hwnd.0 == 0 {
                        return 0;
                    }
                    self.hwnd = Some(hwnd);
                }

                let hwnd = self.hwnd.expect("just created");
                let handle = unsafe {
                    GetPropA(hwnd, PCSTR(b"__wine_x11_whole_window\0".as_ptr()))
                };
                handle.0
            }

            /// The raw window handle the plugin's own editor-open receives.
            pub fn native_handle(&self) -> *mut c_void {
                match self.hwnd {
                    Some(hwnd) => hwnd.0 as *mut c_void,
                    None => std::ptr::null_mut(),
                }
            }

            pub fn show(&mut self) {
                if let Some(hwnd) = self.hwnd {
                    unsafe {
                        ShowWindow(hwnd, SW_SHOWNORMAL);
                        UpdateWindow(hwnd);
                    }
                }
            }

            pub fn destroy(&mut self) {
                if let Some(hwnd) = self.hwnd.take() {
                    unsafe { DestroyWindow(hwnd) };
                }
            }

            /// Drain the native event queue; called from the main serve loop
            /// between poll ticks.
            pub fn pump(&mut self) {
                unsafe {
                    let mut msg = MSG::default();
                    while GetQueueStatus(QS_ALLINPUT) != 0 {
                        if !PeekMessageA(&mut msg, HWND(0), 0, 0, PM_REMOVE).as_bool() {
                            break;
                        }
                        DispatchMessageA(&msg);
                    }
                }
            }
        }

        unsafe extern "system" fn window_proc(
            hwnd: HWND,
            message: u32,
            wparam: WPARAM,
            lparam: LPARAM,
        ) -> LRESULT {
            // Closing the window only hides it; the DAW owns the editor's
            // lifetime through effEditClose
            if message == WM_CLOSE {
                ShowWindow(hwnd, SW_HIDE);
                return LRESULT(1);
            }

            DefWindowProcA(hwnd, message, wparam, lparam)
        }
    } else {
        /// Headless stand-in for builds without the foreign windowing
        /// system: the handle exchange degrades to 0 and the DAW simply gets
        /// no embedded editor.
        pub(super) struct EditorWindow {
            open_logged: bool,
        }

        impl EditorWindow {
            pub fn new() -> Self {
                Self { open_logged: false }
            }

            pub fn open(&mut self, _rect: Option<ERect>) -> isize {
                if !self.open_logged {
                    bridge_log!("no foreign windowing system in this build, editor disabled");
                    self.open_logged = true;
                }
                0
            }

            pub fn native_handle(&self) -> *mut c_void {
                std::ptr::null_mut()
            }

            pub fn show(&mut self) {}

            pub fn destroy(&mut self) {}

            pub fn pump(&mut self) {}
        }
    }
}
